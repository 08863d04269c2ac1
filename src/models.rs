//! Core data models used throughout the temporal harness.
//!
//! These types represent the chunks, extracted dates, persisted temporal
//! records and scored results that flow through indexing and retrieval.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RetrievalError;

/// Characters of chunk text kept in a [`TemporalRecord`] preview.
pub const PREVIEW_CHARS: usize = 300;

/// Which extraction strategy produced a chunk's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    /// Supplied by the chunk source.
    Provided,
    Filename,
    Regex,
    Entity,
    Fuzzy,
    /// Every strategy came up empty.
    Failed,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStrategy::Provided => "provided",
            ExtractionStrategy::Filename => "filename",
            ExtractionStrategy::Regex => "regex",
            ExtractionStrategy::Entity => "entity",
            ExtractionStrategy::Fuzzy => "fuzzy",
            ExtractionStrategy::Failed => "failed",
        }
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStrategy {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provided" => Ok(ExtractionStrategy::Provided),
            "filename" => Ok(ExtractionStrategy::Filename),
            "regex" => Ok(ExtractionStrategy::Regex),
            "entity" => Ok(ExtractionStrategy::Entity),
            "fuzzy" => Ok(ExtractionStrategy::Fuzzy),
            "failed" => Ok(ExtractionStrategy::Failed),
            other => Err(RetrievalError::InvalidParameter(format!(
                "unknown extraction strategy '{}'",
                other
            ))),
        }
    }
}

/// Result of running the timestamp extractor over one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedDate {
    pub date: Option<NaiveDate>,
    pub strategy: ExtractionStrategy,
    pub confidence: f64,
}

impl ExtractedDate {
    pub fn found(date: NaiveDate, strategy: ExtractionStrategy, confidence: f64) -> Self {
        Self {
            date: Some(date),
            strategy,
            confidence,
        }
    }

    pub fn failed() -> Self {
        Self {
            date: None,
            strategy: ExtractionStrategy::Failed,
            confidence: 0.0,
        }
    }
}

/// The smallest retrievable unit of text plus its metadata.
///
/// Built once at ingestion from a [`ChunkInput`] and never mutated by
/// retrieval. The epoch form of the timestamp is always derived from the
/// date, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_document_id: String,
    pub corpus_tag: String,
    pub chunking_method: String,
    pub embedding_method: String,
    pub timestamp: Option<NaiveDate>,
    pub extraction_strategy: ExtractionStrategy,
    pub extraction_confidence: f64,
}

impl Chunk {
    /// `YYYY-MM-DD` form of the timestamp.
    pub fn timestamp_iso(&self) -> Option<String> {
        self.timestamp.map(|d| d.format("%Y-%m-%d").to_string())
    }

    /// Epoch seconds of the timestamp at UTC midnight.
    pub fn timestamp_unix(&self) -> Option<i64> {
        self.timestamp.map(date_to_unix)
    }
}

/// Epoch seconds for a calendar date at UTC midnight.
pub fn date_to_unix(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Calendar date (UTC) of an epoch-seconds value.
pub fn unix_to_date(ts: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// Parse a loosely formatted timestamp string into a calendar date.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and RFC 3339.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    None
}

/// A loosely-typed chunk record as supplied by a chunk source (JSON Lines).
///
/// Every optional field is resolved exactly once when the record is turned
/// into a [`Chunk`] during ingestion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkInput {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(alias = "source_document_id", alias = "document")]
    pub source: String,
    #[serde(default, alias = "timestamp_iso", alias = "date")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub timestamp_unix: Option<i64>,
    #[serde(default)]
    pub chunking_method: Option<String>,
    #[serde(default)]
    pub embedding_method: Option<String>,
    #[serde(default)]
    pub corpus_tag: Option<String>,
}

impl ChunkInput {
    /// Resolve whatever timestamp the source supplied.
    ///
    /// Returns `Ok(None)` when the record carries no timestamp. An
    /// unparseable string, or a string and epoch value naming different
    /// days, is an invalid record.
    pub fn provided_timestamp(&self, id: &str) -> Result<Option<NaiveDate>, RetrievalError> {
        let from_iso = match self.timestamp.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_date(raw).ok_or_else(|| RetrievalError::InvalidRecord {
                id: id.to_string(),
                reason: format!("unparseable timestamp '{}'", raw),
            })?),
        };
        let from_unix = match self.timestamp_unix {
            None => None,
            Some(ts) => Some(unix_to_date(ts).ok_or_else(|| RetrievalError::InvalidRecord {
                id: id.to_string(),
                reason: format!("timestamp_unix {} out of range", ts),
            })?),
        };

        match (from_iso, from_unix) {
            (Some(a), Some(b)) if a != b => Err(RetrievalError::InvalidRecord {
                id: id.to_string(),
                reason: format!("timestamp {} disagrees with timestamp_unix ({})", a, b),
            }),
            (Some(a), _) => Ok(Some(a)),
            (None, b) => Ok(b),
        }
    }
}

/// Persisted per-chunk entry of the temporal index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalRecord {
    pub id: String,
    pub text_preview: String,
    pub source: String,
    pub corpus_tag: String,
    pub chunking_method: String,
    pub embedding_method: String,
    pub timestamp_iso: Option<String>,
    pub timestamp_unix: Option<i64>,
    pub extraction_strategy: ExtractionStrategy,
    pub extraction_confidence: f64,
}

impl TemporalRecord {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            text_preview: preview(&chunk.text, PREVIEW_CHARS),
            source: chunk.source_document_id.clone(),
            corpus_tag: chunk.corpus_tag.clone(),
            chunking_method: chunk.chunking_method.clone(),
            embedding_method: chunk.embedding_method.clone(),
            timestamp_iso: chunk.timestamp_iso(),
            timestamp_unix: chunk.timestamp_unix(),
            extraction_strategy: chunk.extraction_strategy,
            extraction_confidence: chunk.extraction_confidence,
        }
    }

    /// The ISO and epoch fields must both be present or both absent, and
    /// must name the same instant.
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let invalid = |reason: String| RetrievalError::InvalidRecord {
            id: self.id.clone(),
            reason,
        };
        match (&self.timestamp_iso, self.timestamp_unix) {
            (None, None) => Ok(()),
            (Some(iso), Some(ts)) => {
                let date = NaiveDate::parse_from_str(iso, "%Y-%m-%d")
                    .map_err(|e| invalid(format!("bad timestamp_iso '{}': {}", iso, e)))?;
                if date_to_unix(date) != ts {
                    return Err(invalid(format!(
                        "timestamp_unix {} does not match {}",
                        ts, iso
                    )));
                }
                Ok(())
            }
            _ => Err(invalid("timestamp_iso and timestamp_unix must be set together".into())),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.timestamp_iso
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }
}

/// First `max_chars` characters of `text`, with `...` appended when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// A chunk with the scores it earned for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity_score: f64,
    /// Recency score; `None` for undated chunks.
    pub temporal_score: Option<f64>,
    pub combined_score: f64,
    /// 1-based position by combined score.
    pub rank: usize,
}
