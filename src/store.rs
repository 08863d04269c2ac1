//! Persisted temporal index: one [`TemporalRecord`] per chunk.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{ExtractionStrategy, TemporalRecord};

/// Insert or replace records in one transaction. Records whose ISO and
/// epoch timestamps disagree are refused before anything is written.
pub async fn upsert_records(pool: &SqlitePool, records: &[TemporalRecord]) -> Result<usize> {
    for record in records {
        record.validate()?;
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    for r in records {
        sqlx::query(
            r#"
            INSERT INTO temporal_chunks (
                id, text_preview, source, corpus_tag, chunking_method, embedding_method,
                timestamp_iso, timestamp_unix, extraction_strategy, extraction_confidence,
                indexed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                text_preview = excluded.text_preview,
                source = excluded.source,
                corpus_tag = excluded.corpus_tag,
                chunking_method = excluded.chunking_method,
                embedding_method = excluded.embedding_method,
                timestamp_iso = excluded.timestamp_iso,
                timestamp_unix = excluded.timestamp_unix,
                extraction_strategy = excluded.extraction_strategy,
                extraction_confidence = excluded.extraction_confidence,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&r.id)
        .bind(&r.text_preview)
        .bind(&r.source)
        .bind(&r.corpus_tag)
        .bind(&r.chunking_method)
        .bind(&r.embedding_method)
        .bind(&r.timestamp_iso)
        .bind(r.timestamp_unix)
        .bind(r.extraction_strategy.as_str())
        .bind(r.extraction_confidence)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(records.len())
}

/// All records, optionally limited to one chunking method, ordered by id.
pub async fn load_records(
    pool: &SqlitePool,
    chunking_method: Option<&str>,
) -> Result<Vec<TemporalRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, text_preview, source, corpus_tag, chunking_method, embedding_method,
               timestamp_iso, timestamp_unix, extraction_strategy, extraction_confidence
        FROM temporal_chunks
        WHERE ?1 IS NULL OR chunking_method = ?1
        ORDER BY id
        "#,
    )
    .bind(chunking_method)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let strategy: String = row.get("extraction_strategy");
            let extraction_strategy = strategy
                .parse::<ExtractionStrategy>()
                .with_context(|| format!("record {}", id))?;
            Ok(TemporalRecord {
                id,
                text_preview: row.get("text_preview"),
                source: row.get("source"),
                corpus_tag: row.get("corpus_tag"),
                chunking_method: row.get("chunking_method"),
                embedding_method: row.get("embedding_method"),
                timestamp_iso: row.get("timestamp_iso"),
                timestamp_unix: row.get("timestamp_unix"),
                extraction_strategy,
                extraction_confidence: row.get("extraction_confidence"),
            })
        })
        .collect()
}
