//! The embedded transactional store: a `sqlx::SqlitePool` opened in WAL mode
//! with foreign keys enforced and a bounded busy-timeout on lock contention.
//!
//! Grounded on the daemon's `storage::Storage::new`/`migrate` (WAL +
//! `synchronous=normal` connect options, `include_str!`-based migration
//! runner split on `;`), extended with `foreign_keys(true)` and an explicit
//! busy-timeout per the durable-queue schema's requirements.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const MIGRATIONS: &[&str] = &[include_str!("migrations/001_init.sql")];

/// Default bound on how long a query will wait on SQLite's file lock before
/// giving up (overridable per-call via `Store::with_busy_timeout`).
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("creating store directory {}", parent.display())
                })?;
            }
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let opts = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening store at {}", db_path.display()))?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store — used by tests and by nothing else.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in MIGRATIONS {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_cleanly_and_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        // Re-running migrations against the same pool must not error.
        Store::migrate(store.pool()).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
