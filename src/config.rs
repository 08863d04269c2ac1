use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::index::{Bm25Params, HybridWeights, SimilarityMethod};
use crate::retrieve::RetrievalParams;
use crate::temporal::DecayParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_corpus_tags")]
    pub corpus_tags: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            include_globs: default_include_globs(),
            corpus_tags: default_corpus_tags(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/indexes")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string()]
}
fn default_corpus_tags() -> Vec<String> {
    vec!["UK".to_string(), "US".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Leading characters scanned by the entity recognizer.
    #[serde(default = "default_entity_window_chars")]
    pub entity_window_chars: usize,
    /// Leading sentences scanned by the fuzzy parser.
    #[serde(default = "default_fuzzy_sentences")]
    pub fuzzy_sentences: usize,
    #[serde(default = "default_min_year")]
    pub min_year: i32,
    #[serde(default = "default_max_year")]
    pub max_year: i32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            entity_window_chars: default_entity_window_chars(),
            fuzzy_sentences: default_fuzzy_sentences(),
            min_year: default_min_year(),
            max_year: default_max_year(),
        }
    }
}

fn default_entity_window_chars() -> usize {
    500
}
fn default_fuzzy_sentences() -> usize {
    3
}
fn default_min_year() -> i32 {
    1900
}
fn default_max_year() -> i32 {
    2100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_months")]
    pub months: u32,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            k: default_k(),
            months: default_months(),
            alpha: default_alpha(),
            lambda: default_lambda(),
            lexical_weight: default_lexical_weight(),
            dense_weight: default_dense_weight(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
        }
    }
}

fn default_method() -> String {
    "bm25".to_string()
}
fn default_k() -> usize {
    5
}
fn default_months() -> u32 {
    8
}
fn default_alpha() -> f64 {
    0.3
}
fn default_lambda() -> f64 {
    0.5
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_dense_weight() -> f64 {
    0.7
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}

impl RetrievalConfig {
    pub fn similarity_method(&self) -> Result<SimilarityMethod> {
        Ok(self.method.parse::<SimilarityMethod>()?)
    }

    pub fn bm25(&self) -> Bm25Params {
        Bm25Params {
            k1: self.bm25_k1,
            b: self.bm25_b,
        }
    }

    /// Retrieval parameters with the config values, overridable per call.
    pub fn params(&self, k: Option<usize>, months: Option<u32>) -> RetrievalParams {
        RetrievalParams {
            k: k.unwrap_or(self.k),
            months: months.unwrap_or(self.months),
            decay: DecayParams {
                alpha: self.alpha,
                lambda: self.lambda,
            },
            weights: HybridWeights {
                lexical: self.lexical_weight,
                dense: self.dense_weight,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_query_prefix")]
    pub query_prefix: String,
    #[serde(default = "default_passage_prefix")]
    pub passage_prefix: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            query_prefix: default_query_prefix(),
            passage_prefix: default_passage_prefix(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_query_prefix() -> String {
    "query: ".to_string()
}
fn default_passage_prefix() -> String {
    "passage: ".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Tag recorded on chunks embedded with this configuration.
    pub fn method_tag(&self) -> String {
        if self.is_enabled() {
            self.model
                .clone()
                .unwrap_or_else(|| self.provider.clone())
        } else {
            "bm25".to_string()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,
    #[serde(default = "default_synthesis_model")]
    pub model: String,
    #[serde(default = "default_synthesis_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_api_keys_env")]
    pub api_keys_env: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            model: default_synthesis_model(),
            endpoint: default_synthesis_endpoint(),
            api_keys: Vec::new(),
            api_keys_env: default_api_keys_env(),
            max_attempts: default_max_attempts(),
            backoff_cap_secs: default_backoff_cap_secs(),
            timeout_secs: default_synthesis_timeout_secs(),
            temperature: 0.0,
        }
    }
}

fn default_synthesis_provider() -> String {
    "disabled".to_string()
}
fn default_synthesis_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_synthesis_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_api_keys_env() -> String {
    "GEMINI_API_KEYS".to_string()
}
fn default_max_attempts() -> u32 {
    10
}
fn default_backoff_cap_secs() -> u64 {
    10
}
fn default_synthesis_timeout_secs() -> u64 {
    60
}

impl SynthesisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Inline keys first, then any comma-separated keys from the env var.
    pub fn resolve_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if let Ok(raw) = std::env::var(&self.api_keys_env) {
            for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
            }
        }
        keys
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate extraction
    let ex = &config.extraction;
    if ex.min_year > ex.max_year {
        anyhow::bail!(
            "extraction.min_year ({}) must be <= extraction.max_year ({})",
            ex.min_year,
            ex.max_year
        );
    }

    // Validate retrieval
    let r = &config.retrieval;
    r.similarity_method()?;
    if r.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if r.months == 0 {
        anyhow::bail!("retrieval.months must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.alpha) {
        anyhow::bail!("retrieval.alpha must be in [0.0, 1.0]");
    }
    if r.lambda < 0.0 {
        anyhow::bail!("retrieval.lambda must be >= 0.0");
    }
    if r.lexical_weight < 0.0 || r.dense_weight < 0.0 {
        anyhow::bail!("retrieval.lexical_weight and retrieval.dense_weight must be >= 0.0");
    }
    if r.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&r.bm25_b) {
        anyhow::bail!("retrieval.bm25_k1 must be >= 0.0 and retrieval.bm25_b in [0.0, 1.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    let method = config.retrieval.similarity_method()?;
    if method.needs_embeddings() && !config.embedding.is_enabled() {
        anyhow::bail!(
            "retrieval.method '{}' needs embeddings but embedding.provider is disabled",
            method
        );
    }

    // Validate synthesis
    match config.synthesis.provider.as_str() {
        "disabled" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown synthesis provider: '{}'. Must be disabled or gemini.",
            other
        ),
    }
    if config.synthesis.is_enabled() && config.synthesis.max_attempts == 0 {
        anyhow::bail!("synthesis.max_attempts must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let src = format!("[db]\npath = \"/tmp/t.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.retrieval.k, 5);
        assert_eq!(config.retrieval.months, 8);
        assert!((config.retrieval.alpha - 0.3).abs() < 1e-12);
        assert!((config.retrieval.lambda - 0.5).abs() < 1e-12);
        assert_eq!(config.index.corpus_tags, vec!["UK", "US"]);
        assert_eq!(config.extraction.entity_window_chars, 500);
        assert!(!config.embedding.is_enabled());
        assert!(!config.synthesis.is_enabled());
        assert_eq!(config.embedding.method_tag(), "bm25");
        assert_eq!(config.retrieval.method, "bm25");
    }

    #[test]
    fn test_embedding_methods_need_a_provider() {
        let err = parse("[retrieval]\nmethod = \"hybrid\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.provider is disabled"));
        assert!(parse("[retrieval]\nmethod = \"dense\"\n").is_err());
        assert!(parse(
            "[retrieval]\nmethod = \"hybrid\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"m\"\ndims = 8\n"
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_alpha_out_of_range() {
        let err = parse("[retrieval]\nalpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("retrieval.alpha"));
    }

    #[test]
    fn test_rejects_unknown_method() {
        let err = parse("[retrieval]\nmethod = \"tfidf\"\n").unwrap_err();
        assert!(err.to_string().contains("tfidf"));
    }

    #[test]
    fn test_rejects_unknown_synthesis_provider() {
        assert!(parse("[synthesis]\nprovider = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn test_rejects_zero_k_and_months() {
        assert!(parse("[retrieval]\nk = 0\n").is_err());
        assert!(parse("[retrieval]\nmonths = 0\n").is_err());
    }

    #[test]
    fn test_openai_requires_model_and_dims() {
        assert!(parse("[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 8\n").is_ok());
    }

    #[test]
    fn test_inline_keys_are_trimmed_and_deduplicated() {
        let config = parse(
            "[synthesis]\napi_keys = [\" a \", \"\", \"b\"]\napi_keys_env = \"TCTX_TEST_UNSET_KEYS\"\n",
        )
        .unwrap();
        assert_eq!(config.synthesis.resolve_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_params_apply_overrides() {
        let config = parse("").unwrap();
        let params = config.retrieval.params(Some(3), None);
        assert_eq!(params.k, 3);
        assert_eq!(params.months, 8);
        assert!((params.weights.dense - 0.7).abs() < 1e-12);
    }
}
