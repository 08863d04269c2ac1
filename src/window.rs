//! Early/late time windows over a corpus slice.
//!
//! The early window starts at the oldest dated chunk and extends `months`
//! forward; the late window ends at the newest dated chunk and extends
//! `months` back. Both are clamped to the corpus extremes, so
//! `early_end <= max` and `late_start >= min`. On corpora spanning less
//! than `2 · months` the windows overlap.

use chrono::{Months, NaiveDate};
use serde::Serialize;

use crate::models::Chunk;

/// Inclusive date interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Undated chunks are never inside a window.
    pub fn contains_chunk(&self, chunk: &Chunk) -> bool {
        chunk.timestamp.is_some_and(|d| self.contains(d))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemporalWindows {
    pub early: DateRange,
    pub late: DateRange,
    /// False when no chunk carried a date and both windows collapsed to
    /// the query instant.
    pub dated: bool,
}

/// Build windows from the timestamps of a chunk slice.
///
/// With no dated chunks both windows collapse to `now`, which leaves
/// windowed retrieval empty.
pub fn build_windows<I>(timestamps: I, months: u32, now: NaiveDate) -> TemporalWindows
where
    I: IntoIterator<Item = Option<NaiveDate>>,
{
    let mut bounds: Option<(NaiveDate, NaiveDate)> = None;
    for date in timestamps.into_iter().flatten() {
        bounds = Some(match bounds {
            None => (date, date),
            Some((lo, hi)) => (lo.min(date), hi.max(date)),
        });
    }

    let Some((min, max)) = bounds else {
        let point = DateRange { start: now, end: now };
        return TemporalWindows {
            early: point,
            late: point,
            dated: false,
        };
    };

    let span = Months::new(months);
    let early_end = min.checked_add_months(span).map_or(max, |d| d.min(max));
    let late_start = max.checked_sub_months(span).map_or(min, |d| d.max(min));

    TemporalWindows {
        early: DateRange {
            start: min,
            end: early_end,
        },
        late: DateRange {
            start: late_start,
            end: max,
        },
        dated: true,
    }
}

/// Keep chunks dated inside `range`. Undated chunks never qualify.
pub fn filter_by_window<'a, I>(chunks: I, range: DateRange) -> Vec<&'a Chunk>
where
    I: IntoIterator<Item = &'a Chunk>,
{
    chunks
        .into_iter()
        .filter(|c| range.contains_chunk(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn build(dates: &[&str], months: u32) -> TemporalWindows {
        build_windows(dates.iter().map(|s| Some(date(s))), months, date("2030-01-01"))
    }

    #[test]
    fn test_windows_over_two_year_corpus() {
        let w = build(&["2023-03-01", "2024-12-01", "2023-01-01", "2024-11-01"], 8);
        assert_eq!(w.early, DateRange { start: date("2023-01-01"), end: date("2023-09-01") });
        assert_eq!(w.late, DateRange { start: date("2024-04-01"), end: date("2024-12-01") });
        assert!(w.dated);
    }

    #[test]
    fn test_short_corpus_clamps_and_overlaps() {
        let w = build(&["2024-01-01", "2024-05-01"], 8);
        assert_eq!(w.early.end, date("2024-05-01"));
        assert_eq!(w.late.start, date("2024-01-01"));
        assert!(w.early.contains(date("2024-03-01")) && w.late.contains(date("2024-03-01")));
    }

    #[test]
    fn test_month_end_arithmetic() {
        let w = build(&["2023-01-31", "2023-12-31"], 1);
        assert_eq!(w.early.end, date("2023-02-28"));
        assert_eq!(w.late.start, date("2023-11-30"));
    }

    #[test]
    fn test_no_dated_chunks_collapse_to_now() {
        let now = date("2025-06-30");
        let w = build_windows(vec![None, None], 8, now);
        assert_eq!(w.early, DateRange { start: now, end: now });
        assert_eq!(w.late, w.early);
        assert!(!w.dated);
    }

    #[test]
    fn test_single_date() {
        let w = build(&["2020-02-02"], 8);
        assert_eq!(w.early, w.late);
        assert_eq!(w.early.start, w.early.end);
    }

    #[test]
    fn test_one_year_span_covers_range() {
        let w = build(&["2022-01-01", "2022-07-01", "2023-01-01"], 8);
        assert!(w.early.start == date("2022-01-01") && w.late.end == date("2023-01-01"));
        // Together the windows leave no gap.
        assert!(w.late.start <= w.early.end);
    }

    #[test]
    fn test_filter_by_window_is_inclusive_and_skips_undated() {
        use crate::models::ExtractionStrategy;
        let make = |id: &str, ts: Option<&str>| Chunk {
            id: id.to_string(),
            text: String::new(),
            source_document_id: "doc".to_string(),
            corpus_tag: "UK".to_string(),
            chunking_method: "fixed_660".to_string(),
            embedding_method: "bm25".to_string(),
            timestamp: ts.map(date),
            extraction_strategy: ExtractionStrategy::Provided,
            extraction_confidence: 1.0,
        };
        let chunks = vec![
            make("a", Some("2023-01-01")),
            make("b", Some("2023-09-01")),
            make("c", Some("2023-09-02")),
            make("d", None),
        ];
        let range = DateRange {
            start: date("2023-01-01"),
            end: date("2023-09-01"),
        };
        let ids: Vec<&str> = filter_by_window(&chunks, range)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
