//! Chunk loading and index building.
//!
//! Chunks arrive in one of two layouts:
//!
//! - a directory of `<document>_chunks/<chunk>.txt` folders, one per source
//!   document (files directly under the root are their own document);
//! - a JSON Lines file of [`ChunkInput`] records.
//!
//! Each raw record is validated once into a [`Chunk`]. Chunks without a
//! supplied timestamp go through the [`TimestampExtractor`] with the
//! document name as filename hint. `tctx index build` then embeds passages
//! (when a provider is configured), saves the [`SimilarityIndex`] and
//! upserts the temporal records.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::error::RetrievalError;
use crate::extract::TimestampExtractor;
use crate::index::SimilarityIndex;
use crate::models::{Chunk, ChunkInput, ExtractionStrategy, TemporalRecord};
use crate::stats::ExtractionStats;
use crate::store;

/// Tag used when a source name carries none of the configured prefixes.
pub const UNKNOWN_CORPUS: &str = "UNKNOWN";

const CHUNK_DIR_SUFFIX: &str = "_chunks";

/// Read raw chunk records from a directory tree or a `.jsonl` file.
pub fn load_inputs(
    path: &Path,
    chunking_method: &str,
    include_globs: &[String],
) -> Result<Vec<ChunkInput>> {
    if !path.exists() {
        bail!("Chunk source does not exist: {}", path.display());
    }
    if path.is_dir() {
        load_directory(path, chunking_method, include_globs)
    } else {
        load_jsonl(path, chunking_method)
    }
}

/// Walk `root` in sorted order, one [`ChunkInput`] per matching non-empty file.
pub fn load_directory(
    root: &Path,
    chunking_method: &str,
    include_globs: &[String],
) -> Result<Vec<ChunkInput>> {
    let include_set = build_globset(include_globs)?;
    let mut inputs = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !include_set.is_match(relative) {
            continue;
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if text.trim().is_empty() {
            tracing::debug!(path = %relative.display(), "skipping empty chunk file");
            continue;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let document = match relative.parent().and_then(|p| p.file_name()) {
            Some(dir) => {
                let dir = dir.to_string_lossy();
                dir.strip_suffix(CHUNK_DIR_SUFFIX).unwrap_or(&*dir).to_string()
            }
            None => path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        inputs.push(ChunkInput {
            id: Some(format!("{}:{}:{}", chunking_method, document, stem)),
            text,
            source: document,
            chunking_method: Some(chunking_method.to_string()),
            ..ChunkInput::default()
        });
    }

    Ok(inputs)
}

/// One record per non-blank line. Records without an id get
/// `<chunking_method>:<line number>`.
pub fn load_jsonl(path: &Path, chunking_method: &str) -> Result<Vec<ChunkInput>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut inputs = Vec::new();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut input: ChunkInput = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid chunk record", path.display(), n + 1))?;
        if input.id.is_none() {
            input.id = Some(format!("{}:{}", chunking_method, n + 1));
        }
        inputs.push(input);
    }

    Ok(inputs)
}

/// First configured tag `T` for which `source` starts with `T_`, compared
/// case-insensitively.
pub fn corpus_tag_for(source: &str, tags: &[String]) -> String {
    let lower = source.to_lowercase();
    tags.iter()
        .find(|t| lower.starts_with(&format!("{}_", t.to_lowercase())))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_CORPUS.to_string())
}

/// Validate raw records into chunks of one chunking configuration.
///
/// Records naming a different chunking method are skipped. Empty text,
/// bad timestamps and duplicate ids are errors.
pub fn prepare_chunks(
    inputs: Vec<ChunkInput>,
    chunking_method: &str,
    embedding_method: &str,
    corpus_tags: &[String],
    extractor: &TimestampExtractor,
) -> Result<Vec<Chunk>, RetrievalError> {
    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(inputs.len());
    let mut skipped = 0usize;

    for input in inputs {
        if input
            .chunking_method
            .as_deref()
            .is_some_and(|m| m != chunking_method)
        {
            skipped += 1;
            continue;
        }

        let id = input.id.clone().unwrap_or_default();
        if id.is_empty() {
            return Err(RetrievalError::InvalidRecord {
                id,
                reason: "missing chunk id".to_string(),
            });
        }
        if input.text.trim().is_empty() {
            return Err(RetrievalError::InvalidRecord {
                id,
                reason: "empty text".to_string(),
            });
        }
        if !seen.insert(id.clone()) {
            return Err(RetrievalError::InvalidRecord {
                id,
                reason: "duplicate chunk id".to_string(),
            });
        }

        let (timestamp, strategy, confidence) = match input.provided_timestamp(&id)? {
            Some(date) => (Some(date), ExtractionStrategy::Provided, 1.0),
            None => {
                let found = extractor.extract(&input.text, Some(&input.source));
                (found.date, found.strategy, found.confidence)
            }
        };

        let corpus_tag = input
            .corpus_tag
            .clone()
            .unwrap_or_else(|| corpus_tag_for(&input.source, corpus_tags));

        chunks.push(Chunk {
            id,
            text: input.text,
            source_document_id: input.source,
            corpus_tag,
            chunking_method: chunking_method.to_string(),
            embedding_method: input
                .embedding_method
                .unwrap_or_else(|| embedding_method.to_string()),
            timestamp,
            extraction_strategy: strategy,
            extraction_confidence: confidence,
        });
    }

    if skipped > 0 {
        tracing::info!(skipped, chunking_method, "skipped records of other chunking methods");
    }
    Ok(chunks)
}

/// `tctx index build`: load, extract, embed, save, record.
pub async fn run_index_build(
    config: &Config,
    input: &Path,
    chunking_method: &str,
    dry_run: bool,
) -> Result<()> {
    let extractor = TimestampExtractor::new(&config.extraction);
    let inputs = load_inputs(input, chunking_method, &config.index.include_globs)?;
    let chunks = prepare_chunks(
        inputs,
        chunking_method,
        &config.embedding.method_tag(),
        &config.index.corpus_tags,
        &extractor,
    )?;
    let records: Vec<TemporalRecord> = chunks.iter().map(TemporalRecord::from_chunk).collect();
    let stats = ExtractionStats::from_records(&records);

    if dry_run {
        println!("index build {} (dry-run)", chunking_method);
        println!("  chunks found: {}", chunks.len());
        println!(
            "  dated: {} / {} ({:.1}%)",
            stats.dated,
            stats.total,
            stats.success_rate() * 100.0
        );
        return Ok(());
    }

    let embeddings = if config.embedding.is_enabled() && !chunks.is_empty() {
        let provider = embedding::create_provider(&config.embedding)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        tracing::info!(
            model = provider.model_name(),
            chunks = texts.len(),
            "embedding passages"
        );
        Some(embedding::embed_passages(provider.as_ref(), &config.embedding, &texts).await?)
    } else {
        None
    };

    let index = SimilarityIndex::build(chunking_method, chunks, embeddings, config.retrieval.bm25())?;
    let path = index.save(&config.index.dir)?;
    tracing::info!(path = %path.display(), chunks = index.len(), "saved similarity index");

    let pool = db::connect(config).await?;
    let written = store::upsert_records(&pool, &records).await?;
    pool.close().await;

    println!("index build {}", chunking_method);
    println!("  chunks indexed: {}", index.len());
    println!(
        "  dated: {} / {} ({:.1}%)",
        stats.dated,
        stats.total,
        stats.success_rate() * 100.0
    );
    println!(
        "  embeddings: {}",
        index
            .dims()
            .map_or_else(|| "none (lexical only)".to_string(), |d| format!("{} dims", d))
    );
    println!("  temporal records written: {}", written);
    println!("  index: {}", path.display());

    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
