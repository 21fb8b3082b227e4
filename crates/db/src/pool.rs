//! SQLite pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. The writer pool is pinned to a
//! single connection so every write transaction (step claims included) is
//! serialized; the reader pool serves concurrent SELECTs.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::{DbError, Tx};

#[derive(Clone, Debug)]
pub struct DbPool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DbPool {
    /// Open (creating if missing) the database at `database_url`, run the
    /// embedded migrations, and return the split pool.
    ///
    /// `max_readers` controls the reader pool ceiling.
    pub async fn connect(database_url: &str, max_readers: u32) -> Result<Self, DbError> {
        info!("Connecting to database (max_readers={})", max_readers);

        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        // Migrate on the writer before the read-only pool opens the file.
        run_migrations(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(max_readers.max(1))
            .connect_with(base_opts.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }

    /// Begin a write transaction.
    pub async fn begin(&self) -> Result<Tx<'static>, DbError> {
        Ok(self.writer.begin().await?)
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// Commit a write transaction opened by [`DbPool::begin`].
pub async fn commit(tx: Tx<'_>) -> Result<(), DbError> {
    Ok(tx.commit().await?)
}

/// Roll back a write transaction opened by [`DbPool::begin`].
pub async fn rollback(tx: Tx<'_>) -> Result<(), DbError> {
    Ok(tx.rollback().await?)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("orch.db").display());
        let pool = DbPool::connect(&url, 2).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "compensations",
                "jobs",
                "locks",
                "run_steps",
                "run_vars",
                "runs",
                "signals",
                "wait_timers",
                "workflow_defs",
            ]
        );
    }

    #[tokio::test]
    async fn commit_persists_and_rollback_discards() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("orch.db").display());
        let pool = DbPool::connect(&url, 1).await.unwrap();
        let insert = "INSERT INTO jobs (id, kind, payload, run_at, created_at, updated_at) VALUES (?, 'advance', '{}', 't', 't', 't')";

        let mut tx = pool.begin().await.unwrap();
        sqlx::query(insert).bind("kept").execute(&mut *tx).await.unwrap();
        commit(tx).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        sqlx::query(insert).bind("dropped").execute(&mut *tx).await.unwrap();
        rollback(tx).await.unwrap();

        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM jobs")
            .fetch_all(&pool.reader)
            .await
            .unwrap();
        assert_eq!(rows, vec![("kept".to_owned(),)]);
    }

    #[tokio::test]
    async fn writer_uses_wal_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("orch.db").display());
        let pool = DbPool::connect(&url, 1).await.unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let (fk,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }
}
