//! # Temporal Harness
//!
//! Time-aware retrieval over a corpus of dated document chunks.
//!
//! Every chunk carries at most one publication date, recovered by the
//! [`extract`] module from the filename, explicit dates in the text, dated
//! entity phrases or fuzzy references. Retrieval scores chunks lexically
//! (BM25), densely (cosine over embeddings) or with a hybrid of both, then
//! splits the relevant evidence into an early and a late window so the
//! change in a position over time can be read off directly.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ Chunk files │──▶│ Extract+Embed │──▶│ Index (JSON)  │
//! │  / JSONL    │   │               │   │ Records (SQL) │
//! └─────────────┘   └───────────────┘   └───────┬───────┘
//!                                              │
//!                     ┌────────────────────────┤
//!                     ▼                        ▼
//!              ┌─────────────┐          ┌─────────────┐
//!              │  Retrieve   │─────────▶│  Synthesis  │
//!              │ early/late  │          │  (Gemini)   │
//!              └─────────────┘          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Chunks, temporal records, scored results |
//! | [`error`] | Typed retrieval errors |
//! | [`extract`] | Timestamp extraction cascade |
//! | [`index`] | BM25, dense and hybrid similarity index |
//! | [`temporal`] | Recency decay and year detection |
//! | [`window`] | Early and late temporal windows |
//! | [`retrieve`] | Retrieval orchestration |
//! | [`compare`] | Baseline vs temporal rankings |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`synthesis`] | LLM synthesis with credential rotation |
//! | [`ingest`] | Chunk loading and `index build` |
//! | [`store`] | Temporal records in SQLite |
//! | [`stats`] | Extraction statistics |
//! | [`query`] | `search`, `evolve`, `compare`, `extract` commands |
//! | [`batch`] | Batch evolution runs |
//! | [`export`] | JSON export |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod batch;
pub mod compare;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod export;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retrieve;
pub mod stats;
pub mod store;
pub mod synthesis;
pub mod temporal;
pub mod window;
