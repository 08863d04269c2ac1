//! Baseline vs temporal ranking comparison.
//!
//! Over the same type- and year-filtered candidates, ranks once by raw
//! similarity (baseline) and once by decayed combined score (temporal),
//! then merges both top-k lists into one row per chunk.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::RetrievalError;
use crate::index::SimilarityIndex;
use crate::retrieve::{prepare, top_k, RetrievalRequest};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub chunk_id: String,
    pub timestamp_iso: Option<String>,
    pub baseline_rank: Option<usize>,
    pub baseline_score: Option<f64>,
    pub temporal_rank: Option<usize>,
    pub temporal_score: Option<f64>,
}

impl ComparisonRow {
    /// Positive when decay moved the chunk up.
    pub fn rank_shift(&self) -> Option<i64> {
        Some(self.baseline_rank? as i64 - self.temporal_rank? as i64)
    }
}

/// Rows ordered by baseline rank, then temporal rank, then chunk id.
/// Chunks only in one list sort after ranked ones on that side.
pub fn compare_rankings(
    index: &SimilarityIndex,
    req: &RetrievalRequest,
) -> Result<Vec<ComparisonRow>, RetrievalError> {
    let Some(cands) = prepare(index, req)? else {
        return Ok(Vec::new());
    };
    let positions = cands.year_filtered();
    let scores = cands.score(&positions, req)?;
    let chunks = index.chunks();

    // Slots into `positions`/`scores`.
    let mut baseline: Vec<usize> = (0..positions.len()).collect();
    baseline.sort_by(|&a, &b| {
        scores[b]
            .total_cmp(&scores[a])
            .then_with(|| chunks[positions[a]].id.cmp(&chunks[positions[b]].id))
    });
    baseline.truncate(req.params.k);

    let mut rows: BTreeMap<String, ComparisonRow> = BTreeMap::new();
    for (rank, &slot) in baseline.iter().enumerate() {
        let chunk = &chunks[positions[slot]];
        rows.insert(
            chunk.id.clone(),
            ComparisonRow {
                chunk_id: chunk.id.clone(),
                timestamp_iso: chunk.timestamp_iso(),
                baseline_rank: Some(rank + 1),
                baseline_score: Some(scores[slot]),
                temporal_rank: None,
                temporal_score: None,
            },
        );
    }

    for scored in top_k(index, &positions, &scores, req) {
        let row = rows.entry(scored.chunk.id.clone()).or_insert_with(|| ComparisonRow {
            chunk_id: scored.chunk.id.clone(),
            timestamp_iso: scored.chunk.timestamp_iso(),
            baseline_rank: None,
            baseline_score: None,
            temporal_rank: None,
            temporal_score: None,
        });
        row.temporal_rank = Some(scored.rank);
        row.temporal_score = Some(scored.combined_score);
    }

    let mut rows: Vec<ComparisonRow> = rows.into_values().collect();
    rows.sort_by(|a, b| {
        let key = |r: &ComparisonRow| {
            (
                r.baseline_rank.unwrap_or(usize::MAX),
                r.temporal_rank.unwrap_or(usize::MAX),
            )
        };
        key(a).cmp(&key(b)).then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    Ok(rows)
}
