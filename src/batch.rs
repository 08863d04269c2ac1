//! Batch evolution runs.
//!
//! `tctx batch` runs every corpus × system × query combination and writes
//! one JSON line per combination. A system is `<chunking>[:<embedding>]`:
//! the embedding part `bm25` selects lexical scoring over the whole
//! chunking slice, any other value restricts to chunks tagged with that
//! embedding method and scores with the configured method.
//!
//! Failures (missing index, unreachable embedding provider, exhausted
//! synthesis keys) are recorded on the affected lines and the batch moves
//! on. Indexes are loaded once and shared read-only across worker tasks;
//! each combination builds its own request and candidate lists.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Config;
use crate::index::{SimilarityIndex, SimilarityMethod};
use crate::models::ScoredChunk;
use crate::query::query_vector;
use crate::retrieve::{
    temporal_retrieve, CorpusFilter, RetrievalPlan, RetrievalRequest, TemporalRetrieval,
};
use crate::synthesis::EvolutionComparator;

const LEXICAL_TAG: &str = "bm25";

/// One retrieval configuration: a chunking method plus an optional
/// embedding method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct System {
    pub chunking_method: String,
    pub embedding_method: Option<String>,
}

impl FromStr for System {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (chunking, embedding) = match s.split_once(':') {
            Some((c, e)) => (c.trim(), Some(e.trim())),
            None => (s.trim(), None),
        };
        if chunking.is_empty() || embedding.is_some_and(str::is_empty) {
            bail!("invalid system '{}': expected <chunking>[:<embedding>]", s);
        }
        Ok(System {
            chunking_method: chunking.to_string(),
            embedding_method: embedding.map(str::to_string),
        })
    }
}

impl System {
    pub fn method(&self, configured: SimilarityMethod) -> SimilarityMethod {
        match self.embedding_method.as_deref() {
            Some(LEXICAL_TAG) => SimilarityMethod::Bm25,
            _ => configured,
        }
    }

    pub fn filter(&self, corpus: &str) -> CorpusFilter {
        CorpusFilter {
            chunking_method: Some(self.chunking_method.clone()),
            embedding_method: self
                .embedding_method
                .clone()
                .filter(|e| e != LEXICAL_TAG),
            corpus_tag: Some(corpus.to_string()),
        }
    }
}

/// Queries from a text file: one per line, blank lines and `#` comments skipped.
pub fn parse_queries(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchHit {
    pub id: String,
    pub timestamp_iso: Option<String>,
    pub rank: usize,
    pub combined_score: f64,
}

impl From<&ScoredChunk> for BatchHit {
    fn from(s: &ScoredChunk) -> Self {
        Self {
            id: s.chunk.id.clone(),
            timestamp_iso: s.chunk.timestamp_iso(),
            rank: s.rank,
            combined_score: s.combined_score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub corpus: String,
    pub chunking_method: String,
    pub embedding_method: Option<String>,
    pub method: SimilarityMethod,
    pub query: String,
    pub plan: Option<RetrievalPlan>,
    pub early: Vec<BatchHit>,
    pub late: Vec<BatchHit>,
    pub answer: Option<String>,
    pub error: Option<String>,
}

pub struct BatchOptions<'a> {
    pub queries: &'a Path,
    pub corpora: Vec<String>,
    pub systems: Vec<System>,
    pub output: Option<&'a Path>,
    pub synthesize: bool,
    pub as_of: Option<NaiveDate>,
}

pub async fn run_batch(config: &Config, opts: BatchOptions<'_>) -> Result<()> {
    let text = std::fs::read_to_string(opts.queries)
        .with_context(|| format!("Failed to read {}", opts.queries.display()))?;
    let queries = parse_queries(&text);
    if queries.is_empty() {
        bail!("no queries in {}", opts.queries.display());
    }
    if opts.systems.is_empty() {
        bail!("at least one --system is required");
    }
    let corpora = if opts.corpora.is_empty() {
        config.index.corpus_tags.clone()
    } else {
        opts.corpora.clone()
    };

    let configured = config.retrieval.similarity_method()?;
    let params = config.retrieval.params(None, None);
    let query_date = opts
        .as_of
        .unwrap_or_else(|| chrono::Utc::now().date_naive());

    let mut indexes: HashMap<String, Result<Arc<SimilarityIndex>, String>> = HashMap::new();
    for system in &opts.systems {
        indexes
            .entry(system.chunking_method.clone())
            .or_insert_with(|| {
                SimilarityIndex::load(&config.index.dir, &system.chunking_method)
                    .map(Arc::new)
                    .map_err(|e| format!("{:#}", e))
            });
    }

    let needs_vectors = opts
        .systems
        .iter()
        .any(|s| s.method(configured).needs_embeddings());

    let mut comparator = if opts.synthesize {
        Some(EvolutionComparator::from_config(&config.synthesis)?)
    } else {
        None
    };

    let mut out: Box<dyn Write> = match opts.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Box::new(std::io::BufWriter::new(
                std::fs::File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            ))
        }
        None => Box::new(std::io::stdout().lock()),
    };

    let mut written = 0usize;
    let mut failed = 0usize;

    for query in &queries {
        let vector = if needs_vectors {
            query_vector(config, configured, query)
                .await
                .map(|v| v.map(Arc::new))
                .map_err(|e| format!("{:#}", e))
        } else {
            Ok(None)
        };

        // Retrieval for every combination of this query runs in parallel.
        let mut handles = Vec::new();
        for corpus in &corpora {
            for system in &opts.systems {
                let method = system.method(configured);
                let index = indexes[&system.chunking_method].clone();
                let vector = vector.clone();
                let (system, corpus, query) = (system.clone(), corpus.clone(), query.clone());

                handles.push(tokio::task::spawn_blocking(move || {
                    let mut record = BatchRecord {
                        corpus: corpus.clone(),
                        chunking_method: system.chunking_method.clone(),
                        embedding_method: system.embedding_method.clone(),
                        method,
                        query: query.clone(),
                        plan: None,
                        early: Vec::new(),
                        late: Vec::new(),
                        answer: None,
                        error: None,
                    };
                    let outcome = index.and_then(|index| {
                        let vector = match (method.needs_embeddings(), vector) {
                            (false, _) => None,
                            (true, Ok(v)) => v,
                            (true, Err(e)) => return Err(e),
                        };
                        let req = RetrievalRequest {
                            query: &query,
                            query_vec: vector.as_deref().map(Vec::as_slice),
                            method,
                            filter: system.filter(&corpus),
                            query_date,
                            params,
                        };
                        temporal_retrieve(&index, &req).map_err(|e| e.to_string())
                    });
                    match outcome {
                        Ok(result) => record_result(&mut record, &result),
                        Err(e) => record.error = Some(e),
                    }
                    record
                }));
            }
        }

        for handle in handles {
            let mut record = handle.await?;
            if record.error.is_none() {
                if let Some(cmp) = comparator.as_mut() {
                    let (early, late) = hits_as_prompt_input(&record, &indexes);
                    match cmp.compare(&record.query, &early, &late).await {
                        Ok(text) => record.answer = Some(text),
                        Err(e) => record.error = Some(e.to_string()),
                    }
                }
            }
            if record.error.is_some() {
                failed += 1;
                tracing::warn!(
                    corpus = %record.corpus,
                    system = %record.chunking_method,
                    query = %record.query,
                    error = record.error.as_deref().unwrap_or_default(),
                    "batch combination failed"
                );
            }
            serde_json::to_writer(&mut out, &record)?;
            writeln!(out)?;
            written += 1;
        }
    }
    out.flush()?;

    eprintln!(
        "Batch: {} queries x {} corpora x {} systems = {} records ({} failed)",
        queries.len(),
        corpora.len(),
        opts.systems.len(),
        written,
        failed
    );
    Ok(())
}

fn record_result(record: &mut BatchRecord, result: &TemporalRetrieval) {
    record.plan = Some(result.plan.clone());
    record.early = result.early.iter().map(BatchHit::from).collect();
    record.late = result.late.iter().map(BatchHit::from).collect();
}

/// Re-hydrate the chunks behind a record's hits for the synthesis prompt.
fn hits_as_prompt_input(
    record: &BatchRecord,
    indexes: &HashMap<String, Result<Arc<SimilarityIndex>, String>>,
) -> (Vec<ScoredChunk>, Vec<ScoredChunk>) {
    let Some(Ok(index)) = indexes.get(&record.chunking_method) else {
        return (Vec::new(), Vec::new());
    };
    let lookup = |hits: &[BatchHit]| -> Vec<ScoredChunk> {
        hits.iter()
            .filter_map(|h| {
                index.chunks().iter().find(|c| c.id == h.id).map(|c| ScoredChunk {
                    chunk: c.clone(),
                    similarity_score: 0.0,
                    temporal_score: None,
                    combined_score: h.combined_score,
                    rank: h.rank,
                })
            })
            .collect()
    };
    (lookup(&record.early), lookup(&record.late))
}
