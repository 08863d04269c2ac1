//! Similarity index: lexical (BM25) and dense (cosine) relevance scoring.
//!
//! One [`SimilarityIndex`] is built per chunking configuration from an
//! ordered chunk collection and is never mutated afterwards. Scoring always
//! runs over a candidate slice, given as positions into
//! [`SimilarityIndex::chunks`], and returns one score per position. Chunks
//! outside the slice never influence the result.
//!
//! # Scoring
//!
//! | Method | Score |
//! |--------|-------|
//! | [`SimilarityMethod::Bm25`] | Okapi BM25 over lowercase word tokens |
//! | [`SimilarityMethod::Dense`] | cosine similarity of query and chunk embeddings |
//! | [`SimilarityMethod::Hybrid`] | `lexical_weight · minmax(bm25) + dense_weight · cosine` |
//!
//! BM25 per query token (duplicates count again), with `N`, `n(t)` and
//! `avgdl` taken over the slice:
//!
//! ```text
//! idf(t) · tf · (k1 + 1) / (tf + k1 · (1 − b + b · dl / avgdl))
//! idf(t) = ln(1 + (N − n(t) + 0.5) / (n(t) + 0.5))
//! ```
//!
//! The idf is positive even for a term found in every chunk, so a chunk
//! containing a query term always outscores one that does not. Hybrid
//! min-max normalization also runs over the slice.
//!
//! # Persistence
//!
//! The index saves as one JSON document at
//! `<dir>/<chunking_method>/similarity_index.json`, carrying a SHA-256
//! fingerprint of chunk ids and texts that is re-checked on load.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::embedding::cosine_similarity;
use crate::error::RetrievalError;
use crate::models::Chunk;

pub const INDEX_FORMAT_VERSION: u32 = 2;
pub const INDEX_FILE_NAME: &str = "similarity_index.json";

const MINMAX_EPSILON: f64 = 1e-6;

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9']+").expect("valid regex"));

/// Relevance scoring method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMethod {
    Bm25,
    Dense,
    Hybrid,
}

impl SimilarityMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMethod::Bm25 => "bm25",
            SimilarityMethod::Dense => "dense",
            SimilarityMethod::Hybrid => "hybrid",
        }
    }

    pub fn needs_embeddings(&self) -> bool {
        !matches!(self, SimilarityMethod::Bm25)
    }
}

impl fmt::Display for SimilarityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMethod {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bm25" | "lexical" | "keyword" => Ok(SimilarityMethod::Bm25),
            "dense" | "semantic" => Ok(SimilarityMethod::Dense),
            "hybrid" => Ok(SimilarityMethod::Hybrid),
            _ => Err(RetrievalError::UnknownMethod(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Blend weights for [`SimilarityMethod::Hybrid`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub lexical: f64,
    pub dense: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            lexical: 0.3,
            dense: 0.7,
        }
    }
}

/// Lowercase word tokens (letters, digits and apostrophes).
pub fn tokenize(text: &str) -> Vec<String> {
    RE_TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Per-document term frequencies for Okapi BM25.
///
/// Corpus statistics (document count, document frequencies, average length)
/// are not stored: they are computed over whichever slice is being scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalIndex {
    params: Bm25Params,
    term_freqs: Vec<BTreeMap<String, u32>>,
    doc_lens: Vec<u32>,
}

impl LexicalIndex {
    pub fn build<'a>(texts: impl IntoIterator<Item = &'a str>, params: Bm25Params) -> Self {
        let mut term_freqs = Vec::new();
        let mut doc_lens = Vec::new();

        for text in texts {
            let tokens = tokenize(text);
            let mut freqs: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens.iter() {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            doc_lens.push(tokens.len() as u32);
            term_freqs.push(freqs);
        }

        Self {
            params,
            term_freqs,
            doc_lens,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    /// BM25 scores of the documents at `positions`, treating them as the
    /// whole corpus. The result is aligned with `positions`.
    pub fn scores(&self, query: &str, positions: &[usize]) -> Vec<f64> {
        let mut scores = vec![0.0; positions.len()];
        let n = positions.len() as f64;
        let total_len: f64 = positions.iter().map(|&i| self.doc_lens[i] as f64).sum();
        if positions.is_empty() || total_len <= 0.0 {
            return scores;
        }
        let avgdl = total_len / n;
        let Bm25Params { k1, b } = self.params;

        let mut idf_cache: BTreeMap<String, f64> = BTreeMap::new();
        for token in tokenize(query) {
            let idf = *idf_cache.entry(token.clone()).or_insert_with(|| {
                let df = positions
                    .iter()
                    .filter(|&&i| self.term_freqs[i].contains_key(&token))
                    .count() as f64;
                bm25_idf(n, df)
            });
            for (slot, &i) in positions.iter().enumerate() {
                let tf = self.term_freqs[i].get(&token).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = k1 * (1.0 - b + b * self.doc_lens[i] as f64 / avgdl);
                scores[slot] += idf * tf * (k1 + 1.0) / (tf + norm);
            }
        }
        scores
    }
}

/// Smoothed BM25 idf, strictly positive for every `df <= n`.
fn bm25_idf(n: f64, df: f64) -> f64 {
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// Fixed-width embedding matrix, one row per chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseMatrix {
    dims: usize,
    vectors: Vec<Vec<f32>>,
}

impl DenseMatrix {
    pub fn new(vectors: Vec<Vec<f32>>) -> Result<Self, RetrievalError> {
        let dims = vectors.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(RetrievalError::DimensionMismatch {
                expected: dims,
                got: bad.len(),
            });
        }
        Ok(Self { dims, vectors })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn scores(
        &self,
        query_vec: &[f32],
        positions: &[usize],
    ) -> Result<Vec<f64>, RetrievalError> {
        if query_vec.len() != self.dims {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dims,
                got: query_vec.len(),
            });
        }
        Ok(positions
            .iter()
            .map(|&i| cosine_similarity(query_vec, &self.vectors[i]) as f64)
            .collect())
    }
}

/// Immutable per-chunking-configuration relevance index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityIndex {
    version: u32,
    chunking_method: String,
    fingerprint: String,
    chunks: Vec<Chunk>,
    lexical: LexicalIndex,
    dense: Option<DenseMatrix>,
}

impl SimilarityIndex {
    /// Build the index from chunks that all share `chunking_method`.
    ///
    /// `embeddings`, when given, must hold one equal-length vector per chunk
    /// in the same order.
    pub fn build(
        chunking_method: &str,
        chunks: Vec<Chunk>,
        embeddings: Option<Vec<Vec<f32>>>,
        bm25: Bm25Params,
    ) -> Result<Self, RetrievalError> {
        let mut seen = HashSet::new();
        for chunk in &chunks {
            if chunk.chunking_method != chunking_method {
                return Err(RetrievalError::InvalidRecord {
                    id: chunk.id.clone(),
                    reason: format!(
                        "chunking method '{}' does not match index '{}'",
                        chunk.chunking_method, chunking_method
                    ),
                });
            }
            if !seen.insert(chunk.id.as_str()) {
                return Err(RetrievalError::InvalidRecord {
                    id: chunk.id.clone(),
                    reason: "duplicate chunk id".to_string(),
                });
            }
        }

        let dense = match embeddings {
            None => None,
            Some(vectors) => {
                if vectors.len() != chunks.len() {
                    return Err(RetrievalError::InvalidParameter(format!(
                        "{} embeddings for {} chunks",
                        vectors.len(),
                        chunks.len()
                    )));
                }
                Some(DenseMatrix::new(vectors)?)
            }
        };

        let lexical = LexicalIndex::build(chunks.iter().map(|c| c.text.as_str()), bm25);

        Ok(Self {
            version: INDEX_FORMAT_VERSION,
            chunking_method: chunking_method.to_string(),
            fingerprint: fingerprint(&chunks),
            chunks,
            lexical,
            dense,
        })
    }

    pub fn chunking_method(&self) -> &str {
        &self.chunking_method
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn has_embeddings(&self) -> bool {
        self.dense.is_some()
    }

    pub fn dims(&self) -> Option<usize> {
        self.dense.as_ref().map(DenseMatrix::dims)
    }

    /// Positions of every chunk, for scoring the whole index as one slice.
    pub fn all_positions(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }

    pub fn lexical_score(&self, query: &str, positions: &[usize]) -> Vec<f64> {
        self.lexical.scores(query, positions)
    }

    pub fn dense_score(
        &self,
        query_vec: &[f32],
        positions: &[usize],
    ) -> Result<Vec<f64>, RetrievalError> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let dense = self
            .dense
            .as_ref()
            .ok_or_else(|| RetrievalError::MissingEmbeddings(SimilarityMethod::Dense.to_string()))?;
        dense.scores(query_vec, positions)
    }

    pub fn hybrid_score(
        &self,
        query: &str,
        query_vec: &[f32],
        weights: HybridWeights,
        positions: &[usize],
    ) -> Result<Vec<f64>, RetrievalError> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        if self.dense.is_none() {
            return Err(RetrievalError::MissingEmbeddings(
                SimilarityMethod::Hybrid.to_string(),
            ));
        }
        let lexical = minmax_normalize(&self.lexical_score(query, positions));
        let dense = self.dense_score(query_vec, positions)?;
        Ok(lexical
            .iter()
            .zip(dense.iter())
            .map(|(l, d)| weights.lexical * l + weights.dense * d)
            .collect())
    }

    /// Check that `method` can run against this index with the given query
    /// embedding, without scoring anything.
    pub fn check_method(
        &self,
        method: SimilarityMethod,
        query_vec: Option<&[f32]>,
    ) -> Result<(), RetrievalError> {
        if !method.needs_embeddings() {
            return Ok(());
        }
        let dense = self
            .dense
            .as_ref()
            .ok_or_else(|| RetrievalError::MissingEmbeddings(method.to_string()))?;
        let query_vec =
            query_vec.ok_or_else(|| RetrievalError::MissingQueryEmbedding(method.to_string()))?;
        if !self.is_empty() && query_vec.len() != dense.dims() {
            return Err(RetrievalError::DimensionMismatch {
                expected: dense.dims(),
                got: query_vec.len(),
            });
        }
        Ok(())
    }

    /// Scores under `method` for the chunks at `positions`, aligned with
    /// `positions`.
    pub fn score(
        &self,
        method: SimilarityMethod,
        query: &str,
        query_vec: Option<&[f32]>,
        weights: HybridWeights,
        positions: &[usize],
    ) -> Result<Vec<f64>, RetrievalError> {
        self.check_method(method, query_vec)?;
        match (method, query_vec) {
            (SimilarityMethod::Bm25, _) => Ok(self.lexical_score(query, positions)),
            (SimilarityMethod::Dense, Some(v)) => self.dense_score(v, positions),
            (SimilarityMethod::Hybrid, Some(v)) => {
                self.hybrid_score(query, v, weights, positions)
            }
            (_, None) => Err(RetrievalError::MissingQueryEmbedding(method.to_string())),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = index_path(dir, &self.chunking_method);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        writer.flush()?;
        Ok(path)
    }

    pub fn load(dir: &Path, chunking_method: &str) -> Result<Self> {
        let path = index_path(dir, chunking_method);
        if !path.exists() {
            return Err(RetrievalError::MissingIndex(chunking_method.to_string()).into());
        }
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let index: SimilarityIndex = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if index.version != INDEX_FORMAT_VERSION {
            anyhow::bail!(
                "{} has format version {}, expected {} (rebuild the index)",
                path.display(),
                index.version,
                INDEX_FORMAT_VERSION
            );
        }
        if index.fingerprint != fingerprint(&index.chunks) {
            anyhow::bail!("{} is corrupt: fingerprint mismatch", path.display());
        }
        if index.lexical.len() != index.chunks.len() {
            anyhow::bail!("{} is corrupt: lexical index size mismatch", path.display());
        }
        Ok(index)
    }
}

/// Location of the saved index for one chunking configuration.
pub fn index_path(dir: &Path, chunking_method: &str) -> PathBuf {
    let safe: String = chunking_method
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(safe).join(INDEX_FILE_NAME)
}

fn fingerprint(chunks: &[Chunk]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(chunk.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Min-max normalize to `[0, 1]`. A flat vector carries no lexical
/// evidence and normalizes to all zeros.
pub fn minmax_normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = s_max - s_min;
    scores
        .iter()
        .map(|s| {
            if range < MINMAX_EPSILON {
                0.0
            } else {
                (s - s_min) / range
            }
        })
        .collect()
}
