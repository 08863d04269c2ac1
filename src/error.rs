//! Typed errors for the retrieval core.
//!
//! Scoring, windowing and index lookups report configuration problems
//! through [`RetrievalError`] so callers (the batch driver in particular)
//! can record a failure per query and keep going. Application layers wrap
//! these in `anyhow` with extra context.

use thiserror::Error;

/// Failures raised by the similarity index and the retrieval orchestrator.
///
/// Empty candidate sets are not errors; they produce empty result lists.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("unknown similarity method '{0}': expected bm25, dense, or hybrid")]
    UnknownMethod(String),

    #[error("no similarity index for chunking method '{0}' (run `tctx index build` first)")]
    MissingIndex(String),

    #[error("similarity method '{0}' needs chunk embeddings but the index was built without them")]
    MissingEmbeddings(String),

    #[error("similarity method '{0}' needs a query embedding")]
    MissingQueryEmbedding(String),

    #[error("embedding dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid chunk record '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
