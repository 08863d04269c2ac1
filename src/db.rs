//! SQLite pool for the persisted temporal index.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the database named by `[db] path`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    open(&config.db.path).await
}

/// Open (creating if needed) the temporal index database at `path`.
///
/// Batch runs and `index build` may hold the file concurrently, so writers
/// wait on a busy lock instead of failing.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open temporal index at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;

    #[tokio::test]
    async fn test_open_creates_nested_database() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data/nested/tctx.sqlite");

        let pool = open(&path).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM temporal_chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;

        assert_eq!(count, 0);
        assert!(path.exists());
    }
}
