//! Temporal scoring: hard year filter and soft recency decay.
//!
//! Decay blends relevance with a rational recency score:
//!
//! ```text
//! Δyears         = |query_date − chunk_date| in days / 365.25
//! time_score     = 1 / (1 + λ · Δyears)
//! combined_score = (1 − α) · similarity + α · time_score
//! ```
//!
//! Undated chunks keep their similarity unchanged.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Chunk;

const DAYS_PER_YEAR: f64 = 365.25;

static RE_QUERY_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid regex"));

/// Decay weights. `alpha` must lie in `[0, 1]` and `lambda` be non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayParams {
    pub alpha: f64,
    pub lambda: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            lambda: 0.5,
        }
    }
}

/// Recency in `(0, 1]`: 1 at zero distance, strictly decreasing with it.
pub fn time_score(chunk_date: NaiveDate, query_date: NaiveDate, lambda: f64) -> f64 {
    let days = (query_date - chunk_date).num_days().abs() as f64;
    1.0 / (1.0 + lambda * days / DAYS_PER_YEAR)
}

/// Blend similarity with recency. Returns `(combined, time_score)`.
///
/// # Panics
///
/// If `alpha` is outside `[0, 1]` or `lambda` is negative. Callers get
/// these from validated configuration, so a bad value here is a bug.
pub fn time_decay(
    similarity: f64,
    chunk_date: Option<NaiveDate>,
    query_date: NaiveDate,
    params: DecayParams,
) -> (f64, Option<f64>) {
    assert!(
        (0.0..=1.0).contains(&params.alpha),
        "decay alpha {} outside [0, 1]",
        params.alpha
    );
    assert!(params.lambda >= 0.0, "decay lambda {} is negative", params.lambda);

    match chunk_date {
        None => (similarity, None),
        Some(date) => {
            let ts = time_score(date, query_date, params.lambda);
            ((1.0 - params.alpha) * similarity + params.alpha * ts, Some(ts))
        }
    }
}

/// First explicit four-digit year (1900-2099) named in the query.
pub fn extract_query_year(query: &str) -> Option<i32> {
    RE_QUERY_YEAR
        .find(query)
        .and_then(|m| m.as_str().parse().ok())
}

/// Hard-filter predicate: the chunk is dated within `year`.
pub fn in_year(chunk: &Chunk, year: i32) -> bool {
    chunk.timestamp.is_some_and(|d| d.year() == year)
}

/// Keep only chunks dated within `year`. Undated chunks are dropped.
pub fn filter_by_year<'a, I>(chunks: I, year: i32) -> Vec<&'a Chunk>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    chunks.into_iter().filter(|c| in_year(c, year)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionStrategy;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn chunk(id: &str, ts: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: String::new(),
            source_document_id: "doc".to_string(),
            corpus_tag: "US".to_string(),
            chunking_method: "fixed_660".to_string(),
            embedding_method: "bm25".to_string(),
            timestamp: ts.map(date),
            extraction_strategy: ExtractionStrategy::Provided,
            extraction_confidence: 1.0,
        }
    }

    #[test]
    fn test_zero_distance_is_max_recency() {
        let d = date("2022-05-05");
        let params = DecayParams::default();
        let (combined, ts) = time_decay(0.4, Some(d), d, params);
        assert_eq!(ts, Some(1.0));
        assert!((combined - (0.7 * 0.4 + 0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_undated_keeps_similarity() {
        let (combined, ts) = time_decay(0.8, None, date("2024-01-01"), DecayParams::default());
        assert_eq!(combined, 0.8);
        assert_eq!(ts, None);
    }

    #[test]
    fn test_decay_is_symmetric_and_decreasing() {
        let q = date("2020-01-01");
        let before = time_score(date("2018-01-01"), q, 0.5);
        let after = time_score(date("2022-01-01"), q, 0.5);
        assert!((before - after).abs() < 1e-3);

        let near = time_score(date("2019-06-01"), q, 0.5);
        let far = time_score(date("2010-01-01"), q, 0.5);
        assert!(near > far);
        assert!(far > 0.0 && near < 1.0);
    }

    #[test]
    fn test_one_year_value() {
        let ts = time_score(date("2023-01-01"), date("2024-01-01"), 0.5);
        let years = 365.0 / 365.25;
        assert!((ts - 1.0 / (1.0 + 0.5 * years)).abs() < 1e-12);
    }

    #[test]
    fn test_alpha_zero_ignores_time() {
        let params = DecayParams {
            alpha: 0.0,
            lambda: 0.5,
        };
        let (combined, _) = time_decay(0.55, Some(date("1990-01-01")), date("2024-01-01"), params);
        assert_eq!(combined, 0.55);
    }

    #[test]
    #[should_panic(expected = "outside [0, 1]")]
    fn test_bad_alpha_panics() {
        let params = DecayParams {
            alpha: 1.2,
            lambda: 0.5,
        };
        time_decay(0.5, None, date("2024-01-01"), params);
    }

    #[test]
    fn test_extract_query_year() {
        assert_eq!(extract_query_year("What was the budget in 2024?"), Some(2024));
        assert_eq!(extract_query_year("between 1999 and 2003"), Some(1999));
        assert_eq!(extract_query_year("code 12024 or 20245"), None);
        assert_eq!(extract_query_year("no year here"), None);
    }

    #[test]
    fn test_filter_by_year_is_idempotent() {
        let chunks = vec![
            chunk("a", Some("2023-12-31")),
            chunk("b", Some("2024-01-01")),
            chunk("c", None),
            chunk("d", Some("2024-11-30")),
        ];
        let once = filter_by_year(&chunks, 2024);
        let ids: Vec<&str> = once.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);

        let twice = filter_by_year(once.iter().copied(), 2024);
        assert_eq!(once, twice);
    }
}
