//! Query commands: `search`, `evolve`, `compare` and `extract`.
//!
//! Each command loads the saved [`SimilarityIndex`] for one chunking
//! configuration, embeds the query when the similarity method needs a
//! vector, runs the pure retrieval code and prints either a readable
//! listing or JSON.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::Path;

use crate::compare::{compare_rankings, ComparisonRow};
use crate::config::Config;
use crate::embedding;
use crate::error::RetrievalError;
use crate::extract::TimestampExtractor;
use crate::index::{SimilarityIndex, SimilarityMethod};
use crate::models::{preview, ScoredChunk};
use crate::retrieve::{
    retrieve, temporal_retrieve, CorpusFilter, RetrievalPlan, RetrievalRequest,
    TemporalRetrieval,
};
use crate::synthesis::EvolutionComparator;

/// Per-invocation selection of the corpus slice and overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub chunking_method: String,
    pub embedding_method: Option<String>,
    pub corpus: Option<String>,
    pub method: Option<String>,
    pub k: Option<usize>,
    pub months: Option<u32>,
    /// Query instant; today (UTC) when unset.
    pub as_of: Option<NaiveDate>,
}

impl QueryOptions {
    pub fn method(&self, config: &Config) -> Result<SimilarityMethod> {
        match &self.method {
            Some(name) => Ok(name.parse::<SimilarityMethod>()?),
            None => config.retrieval.similarity_method(),
        }
    }

    pub fn filter(&self) -> CorpusFilter {
        CorpusFilter {
            chunking_method: Some(self.chunking_method.clone()),
            embedding_method: self.embedding_method.clone(),
            corpus_tag: self.corpus.clone(),
        }
    }

    pub fn query_date(&self) -> NaiveDate {
        self.as_of
            .unwrap_or_else(|| chrono::Utc::now().date_naive())
    }
}

/// Embed `query` when `method` scores against vectors.
pub async fn query_vector(
    config: &Config,
    method: SimilarityMethod,
    query: &str,
) -> Result<Option<Vec<f32>>> {
    if !method.needs_embeddings() {
        return Ok(None);
    }
    if !config.embedding.is_enabled() {
        return Err(anyhow::Error::new(RetrievalError::MissingQueryEmbedding(
            method.to_string(),
        ))
        .context("embedding.provider is disabled; use --method bm25 or configure a provider"));
    }
    let provider = embedding::create_provider(&config.embedding)?;
    let vector = embedding::embed_query(provider.as_ref(), &config.embedding, query).await?;
    Ok(Some(vector))
}

pub fn load_index(config: &Config, chunking_method: &str) -> Result<SimilarityIndex> {
    SimilarityIndex::load(&config.index.dir, chunking_method)
}

pub async fn run_search(config: &Config, query: &str, opts: &QueryOptions, json: bool) -> Result<()> {
    let index = load_index(config, &opts.chunking_method)?;
    let method = opts.method(config)?;
    let query_vec = query_vector(config, method, query).await?;
    let req = RetrievalRequest {
        query,
        query_vec: query_vec.as_deref(),
        method,
        filter: opts.filter(),
        query_date: opts.query_date(),
        params: config.retrieval.params(opts.k, opts.months),
    };

    let results = retrieve(&index, &req)?;
    tracing::info!(results = results.len(), %method, "search complete");

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for scored in &results {
        print_scored(scored);
    }
    Ok(())
}

#[derive(Serialize)]
struct EvolveOutput<'a> {
    query: &'a str,
    method: SimilarityMethod,
    query_date: NaiveDate,
    #[serde(flatten)]
    retrieval: &'a TemporalRetrieval,
    #[serde(skip_serializing_if = "Option::is_none")]
    synthesis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    synthesis_error: Option<String>,
}

pub async fn run_evolve(
    config: &Config,
    query: &str,
    opts: &QueryOptions,
    synthesize: bool,
    json: bool,
) -> Result<()> {
    let index = load_index(config, &opts.chunking_method)?;
    let method = opts.method(config)?;
    let query_vec = query_vector(config, method, query).await?;
    let query_date = opts.query_date();
    let req = RetrievalRequest {
        query,
        query_vec: query_vec.as_deref(),
        method,
        filter: opts.filter(),
        query_date,
        params: config.retrieval.params(opts.k, opts.months),
    };

    let result = temporal_retrieve(&index, &req)?;

    let (synthesis, synthesis_error) = if synthesize {
        let mut comparator = EvolutionComparator::from_config(&config.synthesis)?;
        match comparator.compare(query, &result.early, &result.late).await {
            Ok(text) => (Some(text), None),
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed");
                (None, Some(e.to_string()))
            }
        }
    } else {
        (None, None)
    };

    if json {
        let out = EvolveOutput {
            query,
            method,
            query_date,
            retrieval: &result,
            synthesis,
            synthesis_error,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match &result.plan {
        RetrievalPlan::Empty => println!("No chunks match this configuration."),
        RetrievalPlan::YearFiltered { year } => {
            println!("Query names {}: both sides use chunks dated in that year.", year)
        }
        RetrievalPlan::Windowed { windows } => {
            println!(
                "Early window: {} .. {}",
                windows.early.start, windows.early.end
            );
            println!(
                "Late window:  {} .. {}",
                windows.late.start, windows.late.end
            );
        }
    }
    println!();
    println!("EARLY (old -> new):");
    print_list(&result.early);
    println!("LATE (new -> old):");
    print_list(&result.late);

    if let Some(text) = synthesis {
        println!("--- EVOLUTION ANALYSIS ---");
        println!("{}", text);
    }
    if let Some(err) = synthesis_error {
        println!("Synthesis failed: {}", err);
    }
    Ok(())
}

pub async fn run_compare(
    config: &Config,
    query: &str,
    opts: &QueryOptions,
    json: bool,
) -> Result<()> {
    let index = load_index(config, &opts.chunking_method)?;
    let method = opts.method(config)?;
    let query_vec = query_vector(config, method, query).await?;
    let req = RetrievalRequest {
        query,
        query_vec: query_vec.as_deref(),
        method,
        filter: opts.filter(),
        query_date: opts.query_date(),
        params: config.retrieval.params(opts.k, opts.months),
    };

    let rows = compare_rankings(&index, &req)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print_comparison(&rows);
    Ok(())
}

#[derive(Serialize)]
struct ExtractOutput {
    date: Option<String>,
    strategy: String,
    confidence: f64,
}

/// Print the extractor's verdict for ad-hoc text or a file.
pub fn run_extract(
    config: &Config,
    text: Option<&str>,
    file: Option<&Path>,
    json: bool,
) -> Result<()> {
    let (body, filename) = match (text, file) {
        (Some(t), _) => (t.to_string(), file.and_then(file_name)),
        (None, Some(path)) => (
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            file_name(path),
        ),
        (None, None) => bail!("Provide TEXT or --file"),
    };

    let extractor = TimestampExtractor::new(&config.extraction);
    let found = extractor.extract(&body, filename.as_deref());
    let out = ExtractOutput {
        date: found.date.map(|d| d.format("%Y-%m-%d").to_string()),
        strategy: found.strategy.to_string(),
        confidence: found.confidence,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("date:       {}", out.date.as_deref().unwrap_or("(none)"));
        println!("strategy:   {}", out.strategy);
        println!("confidence: {:.2}", out.confidence);
    }
    Ok(())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

fn print_list(results: &[ScoredChunk]) {
    if results.is_empty() {
        println!("  (none)");
        println!();
        return;
    }
    for scored in results {
        print_scored(scored);
    }
}

fn print_scored(scored: &ScoredChunk) {
    let chunk = &scored.chunk;
    println!(
        "{}. [{:.4}] {} / {}",
        scored.rank,
        scored.combined_score,
        chunk.corpus_tag,
        chunk.source_document_id
    );
    println!(
        "    date: {} ({}, {:.2})",
        chunk.timestamp_iso().as_deref().unwrap_or("undated"),
        chunk.extraction_strategy,
        chunk.extraction_confidence
    );
    match scored.temporal_score {
        Some(ts) => println!(
            "    similarity: {:.4}  recency: {:.4}",
            scored.similarity_score, ts
        ),
        None => println!("    similarity: {:.4}", scored.similarity_score),
    }
    println!(
        "    excerpt: \"{}\"",
        preview(&chunk.text, 160).replace('\n', " ").trim()
    );
    println!("    id: {}", chunk.id);
    println!();
}

fn print_comparison(rows: &[ComparisonRow]) {
    let rank = |r: Option<usize>| r.map_or_else(|| "-".to_string(), |r| r.to_string());
    let score = |s: Option<f64>| s.map_or_else(|| "-".to_string(), |s| format!("{:.4}", s));

    println!(
        "  {:>6} {:>10} {:>6} {:>10}   {:<10}  {}",
        "BASE", "BASE SCORE", "TEMP", "TEMP SCORE", "DATE", "CHUNK"
    );
    println!("  {}", "-".repeat(76));
    for row in rows {
        println!(
            "  {:>6} {:>10} {:>6} {:>10}   {:<10}  {}",
            rank(row.baseline_rank),
            score(row.baseline_score),
            rank(row.temporal_rank),
            score(row.temporal_score),
            row.timestamp_iso.as_deref().unwrap_or("undated"),
            row.chunk_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str("[db]\npath = \"/tmp/unused.sqlite\"\n").unwrap()
    }

    #[test]
    fn test_options_resolve_method_and_filter() {
        let cfg = config();
        let mut opts = QueryOptions {
            chunking_method: "fixed_660".into(),
            corpus: Some("UK".into()),
            ..Default::default()
        };
        assert_eq!(opts.method(&cfg).unwrap(), SimilarityMethod::Hybrid);
        opts.method = Some("bm25".into());
        assert_eq!(opts.method(&cfg).unwrap(), SimilarityMethod::Bm25);
        opts.method = Some("nope".into());
        assert!(opts.method(&cfg).is_err());

        let filter = opts.filter();
        assert_eq!(filter.chunking_method.as_deref(), Some("fixed_660"));
        assert_eq!(filter.corpus_tag.as_deref(), Some("UK"));
        assert!(filter.embedding_method.is_none());
    }

    #[tokio::test]
    async fn test_dense_query_without_provider_fails_fast() {
        let cfg = config();
        let err = query_vector(&cfg, SimilarityMethod::Dense, "q")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrievalError>(),
            Some(RetrievalError::MissingQueryEmbedding(_))
        ));
        assert!(query_vector(&cfg, SimilarityMethod::Bm25, "q")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_index_mentions_build() {
        let mut cfg = config();
        cfg.index.dir = std::env::temp_dir().join("tctx-no-such-index-dir");
        let err = load_index(&cfg, "fixed_660").unwrap_err();
        assert!(format!("{:#}", err).contains("index build"));
    }
}
