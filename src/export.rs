//! Export the temporal index as JSON.
//!
//! Produces one document holding every persisted [`TemporalRecord`], for
//! downstream analysis outside the harness.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::TemporalRecord;
use crate::store;

#[derive(Serialize)]
struct ExportData {
    exported_at: String,
    count: usize,
    records: Vec<TemporalRecord>,
}

/// Export temporal records as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(
    config: &Config,
    chunking_method: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let records = store::load_records(&pool, chunking_method).await?;
    pool.close().await;

    let data = ExportData {
        exported_at: chrono::Utc::now().to_rfc3339(),
        count: records.len(),
        records,
    };
    let json = serde_json::to_string_pretty(&data)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!("Exported {} temporal records to {}", data.count, path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    Ok(())
}
