//! Time-bounded step locks.
//!
//! A lock row exists per `(run_id, step_id)` while a dispatcher holds it.
//! Expired rows are treated as absent and replaced on the next acquire.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::LockRow;
use crate::DbError;

/// Acquire the lock for a step. Call inside a write transaction so the
/// expiry sweep and the insert are atomic.
pub async fn try_acquire(
    conn: &mut SqliteConnection,
    run_id: Uuid,
    step_id: &str,
    token: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    sqlx::query("DELETE FROM locks WHERE run_id = ? AND step_id = ? AND expires_at <= ?")
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(fmt_ts(&now))
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query(
        r#"
        INSERT INTO locks (run_id, step_id, token, expires_at) VALUES (?, ?, ?, ?)
        ON CONFLICT (run_id, step_id) DO NOTHING
        "#,
    )
    .bind(run_id.to_string())
    .bind(step_id)
    .bind(token)
    .bind(fmt_ts(&expires_at))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Release a lock if `token` still owns it.
pub async fn release<'e, E>(ex: E, run_id: Uuid, step_id: &str, token: &str) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM locks WHERE run_id = ? AND step_id = ? AND token = ?")
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(token)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Drop a step's lock regardless of owner.
pub async fn release_step<'e, E>(ex: E, run_id: Uuid, step_id: &str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM locks WHERE run_id = ? AND step_id = ?")
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn release_all_for_run<'e, E>(ex: E, run_id: Uuid) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM locks WHERE run_id = ?")
        .bind(run_id.to_string())
        .execute(ex)
        .await?;
    Ok(result.rows_affected())
}

pub async fn get_lock<'e, E>(ex: E, run_id: Uuid, step_id: &str) -> Result<Option<LockRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_as::<_, LockRow>(
        "SELECT run_id, step_id, token, expires_at FROM locks WHERE run_id = ? AND step_id = ?",
    )
    .bind(run_id.to_string())
    .bind(step_id)
    .fetch_optional(ex)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{pool, seed_run};
    use chrono::Duration;

    #[tokio::test]
    async fn held_lock_blocks_until_expired() {
        let (_dir, pool) = pool().await;
        let run = seed_run(&pool, &["a"]).await;
        let now = Utc::now();

        let mut tx = pool.begin().await.unwrap();
        assert!(try_acquire(&mut tx, run.id, "a", "one", now + Duration::seconds(30), now).await.unwrap());
        assert!(!try_acquire(&mut tx, run.id, "a", "two", now + Duration::seconds(30), now).await.unwrap());
        tx.commit().await.unwrap();

        let later = now + Duration::seconds(31);
        let mut tx = pool.begin().await.unwrap();
        assert!(try_acquire(&mut tx, run.id, "a", "two", later + Duration::seconds(30), later).await.unwrap());
        tx.commit().await.unwrap();

        let lock = get_lock(&pool.reader, run.id, "a").await.unwrap().unwrap();
        assert_eq!(lock.token, "two");
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let (_dir, pool) = pool().await;
        let run = seed_run(&pool, &["a", "b"]).await;
        let now = Utc::now();

        let mut tx = pool.begin().await.unwrap();
        try_acquire(&mut tx, run.id, "a", "one", now + Duration::seconds(30), now).await.unwrap();
        try_acquire(&mut tx, run.id, "b", "one", now + Duration::seconds(30), now).await.unwrap();
        tx.commit().await.unwrap();

        assert!(!release(&pool.writer, run.id, "a", "other").await.unwrap());
        assert!(release(&pool.writer, run.id, "a", "one").await.unwrap());
        assert_eq!(release_all_for_run(&pool.writer, run.id).await.unwrap(), 1);
        assert!(get_lock(&pool.reader, run.id, "b").await.unwrap().is_none());
    }
}
