//! Extraction statistics over the temporal index.
//!
//! `tctx stats` answers "how much of the corpus is dated, and how
//! trustworthy are those dates": success rate, per-strategy confidence,
//! confidence buckets, per-corpus coverage, year distribution and per
//! chunking method counts.

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db;
use crate::models::{ExtractionStrategy, TemporalRecord};
use crate::store;

const HIGH_CONFIDENCE: f64 = 0.85;
const MEDIUM_CONFIDENCE: f64 = 0.65;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub count: usize,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConfidenceBuckets {
    /// `> 0.85`
    pub high: usize,
    /// `0.65 ..= 0.85`
    pub medium: usize,
    /// `< 0.65`, dated only
    pub low: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Coverage {
    pub total: usize,
    pub dated: usize,
}

impl Coverage {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.dated as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionStats {
    pub total: usize,
    pub dated: usize,
    pub undated: usize,
    pub by_strategy: BTreeMap<ExtractionStrategy, StrategyStats>,
    pub confidence: ConfidenceBuckets,
    pub by_corpus: BTreeMap<String, Coverage>,
    pub by_chunking: BTreeMap<String, usize>,
    pub years: BTreeMap<i32, usize>,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
}

impl ExtractionStats {
    pub fn from_records(records: &[TemporalRecord]) -> Self {
        let mut stats = ExtractionStats {
            total: records.len(),
            ..Default::default()
        };
        let mut confidence_sums: BTreeMap<ExtractionStrategy, f64> = BTreeMap::new();

        for r in records {
            let date = r.date();
            let corpus = stats.by_corpus.entry(r.corpus_tag.clone()).or_default();
            corpus.total += 1;
            *stats.by_chunking.entry(r.chunking_method.clone()).or_default() += 1;

            let entry = stats.by_strategy.entry(r.extraction_strategy).or_default();
            entry.count += 1;
            *confidence_sums.entry(r.extraction_strategy).or_default() += r.extraction_confidence;

            let Some(date) = date else {
                stats.undated += 1;
                continue;
            };
            stats.dated += 1;
            corpus.dated += 1;
            *stats.years.entry(date.year()).or_default() += 1;
            stats.earliest = Some(stats.earliest.map_or(date, |d| d.min(date)));
            stats.latest = Some(stats.latest.map_or(date, |d| d.max(date)));

            let c = r.extraction_confidence;
            if c > HIGH_CONFIDENCE {
                stats.confidence.high += 1;
            } else if c >= MEDIUM_CONFIDENCE {
                stats.confidence.medium += 1;
            } else {
                stats.confidence.low += 1;
            }
        }

        for (strategy, entry) in stats.by_strategy.iter_mut() {
            entry.avg_confidence = confidence_sums[strategy] / entry.count as f64;
        }
        stats
    }

    pub fn success_rate(&self) -> f64 {
        Coverage {
            total: self.total,
            dated: self.dated,
        }
        .rate()
    }
}

/// Run the stats command: load records and print a summary.
pub async fn run_stats(config: &Config, chunking_method: Option<&str>, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let records = store::load_records(&pool, chunking_method).await?;
    pool.close().await;

    let stats = ExtractionStats::from_records(&records);
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Temporal Harness: Extraction Stats");
    println!("==================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Chunks:      {}", stats.total);
    println!(
        "  Dated:       {} / {} ({:.1}%)",
        stats.dated,
        stats.total,
        stats.success_rate() * 100.0
    );
    println!("  Undated:     {}", stats.undated);
    if let (Some(lo), Some(hi)) = (stats.earliest, stats.latest) {
        println!("  Date range:  {} .. {}", lo, hi);
    }

    if !stats.by_strategy.is_empty() {
        println!();
        println!("  By strategy:");
        println!("  {:<12} {:>8} {:>10}", "STRATEGY", "CHUNKS", "AVG CONF");
        println!("  {}", "-".repeat(32));
        for (strategy, s) in &stats.by_strategy {
            println!(
                "  {:<12} {:>8} {:>10.2}",
                strategy.as_str(),
                s.count,
                s.avg_confidence
            );
        }
    }

    println!();
    println!("  Confidence (dated chunks):");
    println!("    high   (> 0.85)       {}", stats.confidence.high);
    println!("    medium (0.65 - 0.85)  {}", stats.confidence.medium);
    println!("    low    (< 0.65)       {}", stats.confidence.low);

    if !stats.by_corpus.is_empty() {
        println!();
        println!("  By corpus:");
        println!("  {:<12} {:>8} {:>8} {:>8}", "CORPUS", "CHUNKS", "DATED", "RATE");
        println!("  {}", "-".repeat(40));
        for (corpus, c) in &stats.by_corpus {
            println!(
                "  {:<12} {:>8} {:>8} {:>7.1}%",
                corpus,
                c.total,
                c.dated,
                c.rate() * 100.0
            );
        }
    }

    if !stats.by_chunking.is_empty() {
        println!();
        println!("  By chunking method:");
        for (method, count) in &stats.by_chunking {
            println!("    {:<20} {}", method, count);
        }
    }

    if !stats.years.is_empty() {
        println!();
        println!("  Year distribution:");
        for (year, count) in &stats.years {
            println!("    {}  {}", year, count);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
