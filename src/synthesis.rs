//! Free-text synthesis over retrieved chunks.
//!
//! An [`EvolutionComparator`] turns ranked early/late lists into a prompt and
//! sends it to a [`SynthesisBackend`]. Access keys live in a
//! [`CredentialPool`]: every transient failure burns the current key and
//! moves the cursor on, and an exhausted pool is a terminal
//! [`SynthesisError`] that the caller records instead of aborting.
//!
//! Keys come from `synthesis.api_keys` or the env var named by
//! `synthesis.api_keys_env` and are never logged.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::SynthesisConfig;
use crate::models::ScoredChunk;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("synthesis is disabled (set synthesis.provider)")]
    Disabled,
    #[error("all API keys exhausted after {attempted} failed key(s)")]
    CredentialsExhausted { attempted: usize },
    #[error("synthesis request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("no answer after {attempts} attempt(s)")]
    AttemptsExhausted { attempts: u32 },
}

/// Outcome of one backend call that did not produce text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendFailure {
    /// Rate limited, forbidden or unknown model for this key.
    #[error("quota or access failure (status {0})")]
    Quota(u16),
    /// Network error or 5xx.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected (status {status})")]
    Rejected { status: u16, body: String },
}

impl BackendFailure {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 | 403 | 404 => BackendFailure::Quota(status),
            500..=599 => BackendFailure::Transport(format!("status {}", status)),
            _ => BackendFailure::Rejected { status, body },
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendFailure::Rejected { .. })
    }
}

/// Ordered access keys with a cursor. Burned keys are never revisited.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    keys: Vec<String>,
    cursor: usize,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, cursor: 0 }
    }

    pub fn current(&self) -> Option<&str> {
        self.keys.get(self.cursor).map(String::as_str)
    }

    /// Burn the current key. Returns the next one, if any.
    pub fn advance(&mut self) -> Option<&str> {
        if self.cursor < self.keys.len() {
            self.cursor += 1;
        }
        self.current()
    }

    pub fn remaining(&self) -> usize {
        self.keys.len() - self.cursor
    }

    pub fn burned(&self) -> usize {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Rendered prompt: system instruction plus user message.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn generate(&self, credential: &str, prompt: &Prompt) -> Result<String, BackendFailure>;
}

/// Google Gemini `generateContent`.
pub struct GeminiBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl GeminiBackend {
    pub fn from_config(config: &SynthesisConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl SynthesisBackend for GeminiBackend {
    async fn generate(&self, credential: &str, prompt: &Prompt) -> Result<String, BackendFailure> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt.user }] }],
            "systemInstruction": { "parts": [{ "text": prompt.system }] },
            "generationConfig": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendFailure::from_status(status.as_u16(), text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendFailure::Transport(e.to_string()))?;
        Ok(parse_gemini_text(&json))
    }
}

fn parse_gemini_text(json: &serde_json::Value) -> String {
    json.pointer("/candidates/0/content/parts/0/text")
        .and_then(|t| t.as_str())
        .unwrap_or("No answer generated.")
        .to_string()
}

/// Attempt bound and backoff between key rotations.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisPolicy {
    pub max_attempts: u32,
    pub backoff_cap: Duration,
}

impl SynthesisPolicy {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// `min(2^attempt, cap)` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.backoff_cap)
    }
}

/// Sends early/late evidence to a backend, rotating keys on failure.
///
/// The pool is owned, so keys burned by one query stay burned for the
/// rest of a batch.
pub struct EvolutionComparator<B> {
    backend: B,
    pool: CredentialPool,
    policy: SynthesisPolicy,
}

impl EvolutionComparator<GeminiBackend> {
    pub fn from_config(config: &SynthesisConfig) -> anyhow::Result<Self> {
        if !config.is_enabled() {
            return Err(SynthesisError::Disabled.into());
        }
        let keys = config.resolve_keys();
        if keys.is_empty() {
            anyhow::bail!(
                "synthesis enabled but no API keys: set synthesis.api_keys or {}",
                config.api_keys_env
            );
        }
        Ok(Self::new(
            GeminiBackend::from_config(config)?,
            CredentialPool::new(keys),
            SynthesisPolicy::from_config(config),
        ))
    }
}

impl<B: SynthesisBackend> EvolutionComparator<B> {
    pub fn new(backend: B, pool: CredentialPool, policy: SynthesisPolicy) -> Self {
        Self {
            backend,
            pool,
            policy,
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Describe the early position, the late position and what changed.
    pub async fn compare(
        &mut self,
        query: &str,
        early: &[ScoredChunk],
        late: &[ScoredChunk],
    ) -> Result<String, SynthesisError> {
        let prompt = evolution_prompt(query, early, late);
        self.run(&prompt).await
    }

    /// Grounded answer from a single ranked list.
    pub async fn answer(
        &mut self,
        query: &str,
        chunks: &[ScoredChunk],
    ) -> Result<String, SynthesisError> {
        let prompt = answer_prompt(query, chunks);
        self.run(&prompt).await
    }

    async fn run(&mut self, prompt: &Prompt) -> Result<String, SynthesisError> {
        for attempt in 0..self.policy.max_attempts {
            let Some(key) = self.pool.current().map(str::to_owned) else {
                return Err(SynthesisError::CredentialsExhausted {
                    attempted: self.pool.burned(),
                });
            };

            match self.backend.generate(&key, prompt).await {
                Ok(text) => return Ok(text),
                Err(BackendFailure::Rejected { status, body }) => {
                    return Err(SynthesisError::Rejected { status, body });
                }
                Err(failure) => {
                    tracing::warn!(
                        key = self.pool.burned() + 1,
                        remaining = self.pool.remaining() - 1,
                        %failure,
                        "synthesis key failed; switching key"
                    );
                    self.pool.advance();
                    let delay = self.policy.backoff(attempt);
                    if !delay.is_zero() && !self.pool.is_exhausted() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if self.pool.is_exhausted() {
            Err(SynthesisError::CredentialsExhausted {
                attempted: self.pool.burned(),
            })
        } else {
            Err(SynthesisError::AttemptsExhausted {
                attempts: self.policy.max_attempts,
            })
        }
    }
}

const EVOLUTION_SYSTEM: &str = "You are an expert temporal analysis assistant. Your goal is to \
identify and explain how views, policies, or situations have CHANGED over time.\n\n\
Your response must follow this structure:\n\
1. EARLY POSITION: Describe the stance or status during the early period.\n\
2. LATE POSITION: Describe the stance or status during the late period.\n\
3. THE EVOLUTION: Explicitly explain what changed between these periods and why, if mentioned.\n\n\
RULES:\n\
- Use ONLY the provided documents.\n\
- Mention if there is a clear trend or if positions remained stable.";

const ANSWER_SYSTEM: &str = "You are an expert information extraction assistant. Answer the \
user's question based ONLY on the provided document chunks.\n\
RULES:\n\
1. Do not use any information that is not explicitly in the provided chunks.\n\
2. If the chunks do not contain enough information, state: 'I cannot answer this question \
based on the provided documents'.\n\
3. For every fact you state, mention its source.\n\
4. Ignore chunks that are irrelevant to the question.\n\
5. If chunks conflict, report both views.";

/// `[ID: <id> | <date or undated>] <text>`
pub fn render_chunk(scored: &ScoredChunk) -> String {
    let chunk = &scored.chunk;
    let when = chunk
        .timestamp_iso()
        .unwrap_or_else(|| "undated".to_string());
    format!("[ID: {} | {}] {}", chunk.id, when, chunk.text)
}

fn render_list(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return "(no documents)".to_string();
    }
    chunks.iter().map(render_chunk).collect::<Vec<_>>().join("\n")
}

pub fn evolution_prompt(query: &str, early: &[ScoredChunk], late: &[ScoredChunk]) -> Prompt {
    Prompt {
        system: EVOLUTION_SYSTEM.to_string(),
        user: format!(
            "Question: {}\n\n--- EARLY PERIOD DOCUMENTS ---\n{}\n\n--- LATE PERIOD DOCUMENTS ---\n{}",
            query,
            render_list(early),
            render_list(late)
        ),
    }
}

pub fn answer_prompt(query: &str, chunks: &[ScoredChunk]) -> Prompt {
    let mut context = String::new();
    for scored in chunks {
        context.push_str(&format!(
            "\n--- Source: {} ---\n{}\n",
            scored.chunk.source_document_id,
            render_chunk(scored)
        ));
    }
    Prompt {
        system: ANSWER_SYSTEM.to_string(),
        user: format!("Context:\n{}\n\nQuestion: {}", context, query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ExtractionStrategy};
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<String, BackendFailure>>>,
        seen_keys: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, BackendFailure>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen_keys: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SynthesisBackend for ScriptedBackend {
        async fn generate(&self, credential: &str, _prompt: &Prompt) -> Result<String, BackendFailure> {
            self.seen_keys.lock().unwrap().push(credential.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendFailure::Quota(429)))
        }
    }

    fn policy(max_attempts: u32) -> SynthesisPolicy {
        SynthesisPolicy {
            max_attempts,
            backoff_cap: Duration::ZERO,
        }
    }

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::new((1..=n).map(|i| format!("key-{}", i)).collect())
    }

    fn scored(id: &str, ts: Option<&str>) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: id.to_string(),
                text: format!("text of {}", id),
                source_document_id: "UK_doc".to_string(),
                corpus_tag: "UK".to_string(),
                chunking_method: "fixed_660".to_string(),
                embedding_method: "bm25".to_string(),
                timestamp: ts.map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()),
                extraction_strategy: ExtractionStrategy::Filename,
                extraction_confidence: 1.0,
            },
            similarity_score: 0.5,
            temporal_score: None,
            combined_score: 0.5,
            rank: 1,
        }
    }

    #[test]
    fn test_pool_cursor() {
        let mut p = pool(2);
        assert_eq!(p.current(), Some("key-1"));
        assert_eq!(p.advance(), Some("key-2"));
        assert_eq!(p.remaining(), 1);
        assert_eq!(p.advance(), None);
        assert!(p.is_exhausted());
        assert_eq!(p.advance(), None);
        assert_eq!(p.burned(), 2);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(BackendFailure::from_status(429, String::new()), BackendFailure::Quota(429));
        assert!(BackendFailure::from_status(503, String::new()).is_transient());
        assert!(!BackendFailure::from_status(400, "bad".into()).is_transient());
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = SynthesisPolicy {
            max_attempts: 3,
            backoff_cap: Duration::from_secs(10),
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(4), Duration::from_secs(10));
        assert_eq!(p.backoff(80), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_rotates_to_next_key_on_quota() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendFailure::Quota(429)),
            Err(BackendFailure::Transport("reset".into())),
            Ok("changed a lot".into()),
        ]);
        let mut cmp = EvolutionComparator::new(backend, pool(5), policy(10));
        let out = cmp.compare("q", &[], &[]).await.unwrap();
        assert_eq!(out, "changed a lot");
        assert_eq!(cmp.pool().burned(), 2);
        let seen = cmp.backend.seen_keys.lock().unwrap().clone();
        assert_eq!(seen, vec!["key-1", "key-2", "key-3"]);
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_terminal_and_sticky() {
        let backend = ScriptedBackend::new(vec![]);
        let mut cmp = EvolutionComparator::new(backend, pool(2), policy(10));
        let err = cmp.compare("q", &[], &[]).await.unwrap_err();
        assert_eq!(err, SynthesisError::CredentialsExhausted { attempted: 2 });

        // The next query in the batch fails immediately.
        let err = cmp.answer("q2", &[]).await.unwrap_err();
        assert_eq!(err, SynthesisError::CredentialsExhausted { attempted: 2 });
        assert_eq!(cmp.backend.seen_keys.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_does_not_burn_key() {
        let backend = ScriptedBackend::new(vec![Err(BackendFailure::Rejected {
            status: 400,
            body: "bad request".into(),
        })]);
        let mut cmp = EvolutionComparator::new(backend, pool(3), policy(10));
        let err = cmp.answer("q", &[]).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Rejected { status: 400, .. }));
        assert_eq!(cmp.pool().burned(), 0);
    }

    #[tokio::test]
    async fn test_attempt_bound() {
        let backend = ScriptedBackend::new(vec![]);
        let mut cmp = EvolutionComparator::new(backend, pool(10), policy(3));
        let err = cmp.compare("q", &[], &[]).await.unwrap_err();
        assert_eq!(err, SynthesisError::AttemptsExhausted { attempts: 3 });
        assert_eq!(cmp.pool().remaining(), 7);
    }

    #[test]
    fn test_evolution_prompt_layout() {
        let early = vec![scored("a", Some("2023-01-01"))];
        let late = vec![scored("b", None)];
        let prompt = evolution_prompt("How did it change?", &early, &late);
        assert!(prompt.system.contains("EARLY POSITION"));
        assert!(prompt.user.starts_with("Question: How did it change?"));
        assert!(prompt.user.contains("[ID: a | 2023-01-01] text of a"));
        assert!(prompt.user.contains("[ID: b | undated] text of b"));
        let early_pos = prompt.user.find("EARLY PERIOD").unwrap();
        let late_pos = prompt.user.find("LATE PERIOD").unwrap();
        assert!(early_pos < late_pos);
    }

    #[test]
    fn test_answer_prompt_names_sources() {
        let prompt = answer_prompt("what?", &[scored("a", Some("2020-02-02"))]);
        assert!(prompt.user.contains("--- Source: UK_doc ---"));
        assert!(prompt.user.ends_with("Question: what?"));
    }

    #[test]
    fn test_parse_gemini_text() {
        let json = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "answer" }] } }]
        });
        assert_eq!(parse_gemini_text(&json), "answer");
        assert_eq!(parse_gemini_text(&serde_json::json!({})), "No answer generated.");
    }
}
