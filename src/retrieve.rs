//! Retrieval orchestration over a [`SimilarityIndex`].
//!
//! [`temporal_retrieve`] answers "how did this change" queries with two
//! ranked lists, early and late:
//!
//! 1. **Type filter**: keep chunks of the requested chunking/embedding
//!    configuration and corpus tag. Nothing left means two empty lists.
//! 2. **Year filter**: if the query names a year, both sides use the chunks
//!    dated in that year and windows are skipped.
//! 3. **Windows**: otherwise build early/late windows over the type-filtered
//!    chunks and keep dated chunks inside each.
//! 4. **Retrieve**: score each side's candidates on their own (BM25
//!    statistics and hybrid normalization see only that side), apply
//!    recency decay, keep the top `k` by combined score (ties by chunk id).
//! 5. **Order**: early lists run oldest first, late lists newest first, and
//!    undated chunks go last either way.
//!
//! Everything here is synchronous and allocates its own working state, so
//! one shared index can serve many queries in parallel.

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;

use crate::error::RetrievalError;
use crate::index::{HybridWeights, SimilarityIndex, SimilarityMethod};
use crate::models::{Chunk, ScoredChunk};
use crate::temporal::{extract_query_year, in_year, time_decay, DecayParams};
use crate::window::{build_windows, DateRange, TemporalWindows};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetrievalParams {
    pub k: usize,
    pub months: u32,
    pub decay: DecayParams,
    pub weights: HybridWeights,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            k: 5,
            months: 8,
            decay: DecayParams::default(),
            weights: HybridWeights::default(),
        }
    }
}

impl RetrievalParams {
    fn validate(&self) -> Result<(), RetrievalError> {
        if self.k == 0 {
            return Err(RetrievalError::InvalidParameter("k must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.decay.alpha) {
            return Err(RetrievalError::InvalidParameter(format!(
                "alpha {} outside [0, 1]",
                self.decay.alpha
            )));
        }
        if self.decay.lambda < 0.0 {
            return Err(RetrievalError::InvalidParameter(format!(
                "lambda {} is negative",
                self.decay.lambda
            )));
        }
        Ok(())
    }
}

/// Restricts retrieval to one configuration slice. `None` fields match all.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusFilter {
    pub chunking_method: Option<String>,
    pub embedding_method: Option<String>,
    pub corpus_tag: Option<String>,
}

impl CorpusFilter {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.chunking_method
            .as_deref()
            .map_or(true, |m| chunk.chunking_method == m)
            && self
                .embedding_method
                .as_deref()
                .map_or(true, |m| chunk.embedding_method == m)
            && self
                .corpus_tag
                .as_deref()
                .map_or(true, |t| chunk.corpus_tag.eq_ignore_ascii_case(t))
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    /// Required for dense and hybrid scoring.
    pub query_vec: Option<&'a [f32]>,
    pub method: SimilarityMethod,
    pub filter: CorpusFilter,
    /// Reference instant for recency decay and the no-dates fallback.
    pub query_date: NaiveDate,
    pub params: RetrievalParams,
}

/// How a temporal retrieval split the corpus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalPlan {
    /// The type filter left nothing.
    Empty,
    YearFiltered { year: i32 },
    Windowed { windows: TemporalWindows },
}

#[derive(Debug, Clone, Serialize)]
pub struct TemporalRetrieval {
    pub early: Vec<ScoredChunk>,
    pub late: Vec<ScoredChunk>,
    pub plan: RetrievalPlan,
}

impl TemporalRetrieval {
    fn empty() -> Self {
        Self {
            early: Vec::new(),
            late: Vec::new(),
            plan: RetrievalPlan::Empty,
        }
    }
}

/// Type-filtered candidate positions for one request.
pub(crate) struct Candidates<'i> {
    pub index: &'i SimilarityIndex,
    pub positions: Vec<usize>,
    pub year: Option<i32>,
}

impl Candidates<'_> {
    /// Similarity scores of `positions`, computed as if they were the
    /// whole corpus. Aligned with `positions`.
    pub fn score(
        &self,
        positions: &[usize],
        req: &RetrievalRequest,
    ) -> Result<Vec<f64>, RetrievalError> {
        self.index.score(
            req.method,
            req.query,
            req.query_vec,
            req.params.weights,
            positions,
        )
    }

    /// Apply the hard year filter when the query names a year.
    pub fn year_filtered(&self) -> Vec<usize> {
        match self.year {
            None => self.positions.clone(),
            Some(year) => self
                .positions
                .iter()
                .copied()
                .filter(|&i| in_year(&self.index.chunks()[i], year))
                .collect(),
        }
    }
}

/// Validate the request and run the type filter. Returns `None` when no
/// chunk survives it.
pub(crate) fn prepare<'i>(
    index: &'i SimilarityIndex,
    req: &RetrievalRequest,
) -> Result<Option<Candidates<'i>>, RetrievalError> {
    req.params.validate()?;
    index.check_method(req.method, req.query_vec)?;

    let positions: Vec<usize> = index
        .chunks()
        .iter()
        .enumerate()
        .filter(|(_, c)| req.filter.matches(c))
        .map(|(i, _)| i)
        .collect();
    if positions.is_empty() {
        tracing::debug!(filter = ?req.filter, "type filter left no candidates");
        return Ok(None);
    }

    Ok(Some(Candidates {
        index,
        positions,
        year: extract_query_year(req.query),
    }))
}

/// Early and late ranked lists for an evolution query.
pub fn temporal_retrieve(
    index: &SimilarityIndex,
    req: &RetrievalRequest,
) -> Result<TemporalRetrieval, RetrievalError> {
    let Some(cands) = prepare(index, req)? else {
        return Ok(TemporalRetrieval::empty());
    };

    let (mut early, mut late, plan) = match cands.year {
        Some(year) => {
            let filtered = cands.year_filtered();
            tracing::debug!(year, candidates = filtered.len(), "query names a year");
            let scores = cands.score(&filtered, req)?;
            let ranked = top_k(index, &filtered, &scores, req);
            (ranked.clone(), ranked, RetrievalPlan::YearFiltered { year })
        }
        None => {
            let chunks = index.chunks();
            let windows = build_windows(
                cands.positions.iter().map(|&i| chunks[i].timestamp),
                req.params.months,
                req.query_date,
            );
            let inside = |range: DateRange| -> Vec<usize> {
                cands
                    .positions
                    .iter()
                    .copied()
                    .filter(|&i| range.contains_chunk(&chunks[i]))
                    .collect()
            };
            let early = inside(windows.early);
            let late = inside(windows.late);
            tracing::debug!(
                early_start = %windows.early.start,
                early_end = %windows.early.end,
                late_start = %windows.late.start,
                late_end = %windows.late.end,
                early = early.len(),
                late = late.len(),
                "built temporal windows"
            );
            let early_scores = cands.score(&early, req)?;
            let late_scores = cands.score(&late, req)?;
            (
                top_k(index, &early, &early_scores, req),
                top_k(index, &late, &late_scores, req),
                RetrievalPlan::Windowed { windows },
            )
        }
    };

    order_by_time(&mut early, TimeOrder::OldestFirst);
    order_by_time(&mut late, TimeOrder::NewestFirst);

    Ok(TemporalRetrieval { early, late, plan })
}

/// Single ranked list: type filter, year filter, decay, top `k`.
///
/// Results stay in relevance order.
pub fn retrieve(
    index: &SimilarityIndex,
    req: &RetrievalRequest,
) -> Result<Vec<ScoredChunk>, RetrievalError> {
    let Some(cands) = prepare(index, req)? else {
        return Ok(Vec::new());
    };
    let positions = cands.year_filtered();
    let scores = cands.score(&positions, req)?;
    Ok(top_k(index, &positions, &scores, req))
}

/// Apply decay to `positions` and keep the best `k`. `scores` is aligned
/// with `positions`.
pub(crate) fn top_k(
    index: &SimilarityIndex,
    positions: &[usize],
    scores: &[f64],
    req: &RetrievalRequest,
) -> Vec<ScoredChunk> {
    let chunks = index.chunks();
    let mut scored: Vec<ScoredChunk> = positions
        .iter()
        .zip(scores)
        .map(|(&i, &similarity)| {
            let chunk = &chunks[i];
            let (combined, temporal) =
                time_decay(similarity, chunk.timestamp, req.query_date, req.params.decay);
            ScoredChunk {
                chunk: chunk.clone(),
                similarity_score: similarity,
                temporal_score: temporal,
                combined_score: combined,
                rank: 0,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    scored.truncate(req.params.k);
    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scored
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrder {
    OldestFirst,
    NewestFirst,
}

/// Re-sort by timestamp; undated chunks last, ties by relevance rank.
pub fn order_by_time(results: &mut [ScoredChunk], order: TimeOrder) {
    results.sort_by(|a, b| {
        let by_time = match (a.chunk.timestamp, b.chunk.timestamp) {
            (Some(x), Some(y)) => match order {
                TimeOrder::OldestFirst => x.cmp(&y),
                TimeOrder::NewestFirst => y.cmp(&x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time
            .then(a.rank.cmp(&b.rank))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Bm25Params;
    use crate::models::ExtractionStrategy;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn chunk(id: &str, text: &str, ts: Option<&str>, tag: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source_document_id: format!("{}_doc", tag),
            corpus_tag: tag.to_string(),
            chunking_method: "fixed_660".to_string(),
            embedding_method: "bm25".to_string(),
            timestamp: ts.map(date),
            extraction_strategy: ExtractionStrategy::Provided,
            extraction_confidence: 1.0,
        }
    }

    fn index(chunks: Vec<Chunk>) -> SimilarityIndex {
        SimilarityIndex::build("fixed_660", chunks, None, Bm25Params::default()).unwrap()
    }

    fn request(query: &str) -> RetrievalRequest<'_> {
        RetrievalRequest {
            query,
            query_vec: None,
            method: SimilarityMethod::Bm25,
            filter: CorpusFilter::default(),
            query_date: date("2025-01-01"),
            params: RetrievalParams::default(),
        }
    }

    fn ids(results: &[ScoredChunk]) -> Vec<&str> {
        results.iter().map(|s| s.chunk.id.as_str()).collect()
    }

    #[test]
    fn test_windows_split_early_and_late() {
        let idx = index(vec![
            chunk("a", "tax policy", Some("2023-01-01"), "UK"),
            chunk("b", "tax policy reform", Some("2023-03-01"), "UK"),
            chunk("c", "tax policy again", Some("2024-11-01"), "UK"),
            chunk("d", "tax policy final", Some("2024-12-01"), "UK"),
            chunk("e", "tax policy undated", None, "UK"),
        ]);
        let out = temporal_retrieve(&idx, &request("tax policy")).unwrap();
        assert_eq!(ids(&out.early), vec!["a", "b"]);
        assert_eq!(ids(&out.late), vec!["d", "c"]);
        assert!(matches!(out.plan, RetrievalPlan::Windowed { .. }));
    }

    #[test]
    fn test_year_query_collapses_both_sides() {
        let idx = index(vec![
            chunk("a", "budget", Some("2023-05-01"), "US"),
            chunk("b", "budget", Some("2024-02-01"), "US"),
            chunk("c", "budget", Some("2024-09-01"), "US"),
            chunk("d", "budget", None, "US"),
        ]);
        let out = temporal_retrieve(&idx, &request("What was the budget in 2024?")).unwrap();
        assert_eq!(out.plan, RetrievalPlan::YearFiltered { year: 2024 });
        assert_eq!(ids(&out.early), vec!["b", "c"]);
        assert_eq!(ids(&out.late), vec!["c", "b"]);
    }

    #[test]
    fn test_year_with_no_match_is_empty_not_error() {
        let idx = index(vec![chunk("a", "budget", Some("2023-05-01"), "US")]);
        let out = temporal_retrieve(&idx, &request("budget in 1999")).unwrap();
        assert!(out.early.is_empty() && out.late.is_empty());
    }

    #[test]
    fn test_type_filter_empty_returns_empty() {
        let idx = index(vec![chunk("a", "budget", Some("2023-05-01"), "US")]);
        let mut req = request("budget");
        req.filter.corpus_tag = Some("UK".to_string());
        let out = temporal_retrieve(&idx, &req).unwrap();
        assert_eq!(out.plan, RetrievalPlan::Empty);
        assert!(out.early.is_empty() && out.late.is_empty());
    }

    #[test]
    fn test_top_k_by_relevance_then_time_order() {
        let idx = index(vec![
            chunk("a", "unrelated words", Some("2020-01-01"), "UK"),
            chunk("b", "climate climate", Some("2020-02-01"), "UK"),
            chunk("c", "climate", Some("2020-03-01"), "UK"),
            chunk("d", "climate climate climate", Some("2020-04-01"), "UK"),
        ]);
        let mut req = request("climate");
        req.params.k = 2;
        let out = temporal_retrieve(&idx, &req).unwrap();
        // All four fit one window; d and b are most relevant.
        assert_eq!(ids(&out.early), vec!["b", "d"]);
        assert_eq!(ids(&out.late), vec!["d", "b"]);
        assert_eq!(out.late[0].rank, 1);
    }

    #[test]
    fn test_other_corpus_does_not_change_ranking() {
        let uk = vec![
            chunk("uk1", "tax cuts announced today", Some("2024-01-01"), "UK"),
            chunk("uk2", "weather mild today", Some("2024-02-01"), "UK"),
        ];
        let mut req = request("tax");
        req.filter.corpus_tag = Some("UK".to_string());

        let alone = temporal_retrieve(&index(uk.clone()), &req).unwrap();

        let mut mixed = uk;
        for i in 0..6 {
            mixed.push(chunk(&format!("us{}", i), "tax tax budget", Some("2024-01-15"), "US"));
        }
        let with_us = temporal_retrieve(&index(mixed), &req).unwrap();

        assert_eq!(alone.early, with_us.early);
        assert_eq!(alone.late, with_us.late);
        assert!(alone.early[0].similarity_score > 0.0);
        assert_eq!(alone.early[1].similarity_score, 0.0);
    }

    #[test]
    fn test_ties_break_by_id() {
        let idx = index(vec![
            chunk("z", "same text", Some("2021-01-01"), "UK"),
            chunk("m", "same text", Some("2021-01-01"), "UK"),
            chunk("a", "same text", Some("2021-01-01"), "UK"),
        ]);
        let results = retrieve(&idx, &request("same")).unwrap();
        assert_eq!(ids(&results), vec!["a", "m", "z"]);
        assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_retrieve_keeps_undated_with_unchanged_score() {
        let idx = index(vec![
            chunk("a", "pension reform", None, "UK"),
            chunk("b", "pension", Some("2024-06-01"), "UK"),
            chunk("c", "nothing", Some("2024-06-01"), "UK"),
        ]);
        let results = retrieve(&idx, &request("pension")).unwrap();
        let undated = results.iter().find(|r| r.chunk.id == "a").unwrap();
        assert_eq!(undated.combined_score, undated.similarity_score);
        assert_eq!(undated.temporal_score, None);
    }

    #[test]
    fn test_order_by_time_puts_undated_last() {
        let idx = index(vec![
            chunk("a", "x", None, "UK"),
            chunk("b", "x", Some("2020-01-01"), "UK"),
            chunk("c", "x", Some("2022-01-01"), "UK"),
        ]);
        let mut results = retrieve(&idx, &request("x")).unwrap();
        order_by_time(&mut results, TimeOrder::OldestFirst);
        assert_eq!(ids(&results), vec!["b", "c", "a"]);
        order_by_time(&mut results, TimeOrder::NewestFirst);
        assert_eq!(ids(&results), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_unknown_configuration_fails_fast() {
        let idx = index(vec![chunk("a", "x", None, "UK")]);
        let mut req = request("x");
        req.method = SimilarityMethod::Dense;
        assert!(matches!(
            temporal_retrieve(&idx, &req),
            Err(RetrievalError::MissingEmbeddings(_))
        ));

        let mut req = request("x");
        req.params.k = 0;
        assert!(matches!(
            retrieve(&idx, &req),
            Err(RetrievalError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_filter_matches_configuration() {
        let c = chunk("a", "x", None, "UK");
        let filter = CorpusFilter {
            chunking_method: Some("fixed_660".into()),
            embedding_method: Some("bm25".into()),
            corpus_tag: Some("uk".into()),
        };
        assert!(filter.matches(&c));
        let other = CorpusFilter {
            embedding_method: Some("e5".into()),
            ..Default::default()
        };
        assert!(!other.matches(&c));
    }
}
