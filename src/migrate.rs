use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the temporal index schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per chunk; the timestamp does not depend on the embedding method.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS temporal_chunks (
            id TEXT PRIMARY KEY,
            text_preview TEXT NOT NULL,
            source TEXT NOT NULL,
            corpus_tag TEXT NOT NULL,
            chunking_method TEXT NOT NULL,
            embedding_method TEXT NOT NULL,
            timestamp_iso TEXT,
            timestamp_unix INTEGER,
            extraction_strategy TEXT NOT NULL,
            extraction_confidence REAL NOT NULL,
            indexed_at INTEGER NOT NULL,
            CHECK ((timestamp_iso IS NULL) = (timestamp_unix IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_temporal_chunks_config \
         ON temporal_chunks(chunking_method, embedding_method, corpus_tag)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_temporal_chunks_ts ON temporal_chunks(timestamp_unix)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
