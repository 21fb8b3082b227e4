//! Job queue repository functions.
//!
//! The queue is backed by the `jobs` table. Workers poll for the oldest due
//! `pending` row; the claim runs as a write transaction on the single writer
//! connection, so two workers can never take the same job.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::JobRow;
use crate::{DbError, DbPool};

const COLUMNS: &str =
    "id, kind, payload, status, attempts, max_attempts, run_at, last_error, created_at, updated_at";

/// Enqueue a new job that becomes visible at `run_at`.
pub async fn enqueue_job<'e, E>(
    ex: E,
    kind: &str,
    payload: &Value,
    run_at: DateTime<Utc>,
    max_attempts: u32,
) -> Result<JobRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4();
    let now = Utc::now();

    let sql = format!(
        r#"
        INSERT INTO jobs (id, kind, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
        VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)
        RETURNING {COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id.to_string())
        .bind(kind)
        .bind(serde_json::to_string(payload)?)
        .bind(i64::from(max_attempts))
        .bind(fmt_ts(&run_at))
        .bind(fmt_ts(&now))
        .bind(fmt_ts(&now))
        .fetch_one(ex)
        .await?;

    Ok(row)
}

/// Atomically fetch the oldest due pending job and mark it as `processing`.
///
/// Returns `None` if no job is due.
pub async fn fetch_next_job(pool: &DbPool, now: DateTime<Utc>) -> Result<Option<JobRow>, DbError> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM jobs
        WHERE status = 'pending' AND run_at <= ?
        ORDER BY run_at ASC, created_at ASC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(fmt_ts(&now))
        .fetch_optional(&mut *tx)
        .await?;

    let Some(job) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let sql = format!(
        r#"
        UPDATE jobs
        SET status = 'processing', attempts = attempts + 1, updated_at = ?
        WHERE id = ?
        RETURNING {COLUMNS}
        "#
    );
    let claimed = sqlx::query_as::<_, JobRow>(&sql)
        .bind(fmt_ts(&now))
        .bind(job.id.to_string())
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Some(claimed))
}

/// Return every `processing` job to `pending`. A job is only `processing`
/// while a worker holds it, so at startup these belong to a dead worker.
/// Returns the number of jobs requeued.
pub async fn requeue_in_flight<'e, E>(ex: E, now: DateTime<Utc>) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE jobs SET status = 'pending', run_at = ?, updated_at = ? WHERE status = 'processing'")
        .bind(fmt_ts(&now))
        .bind(fmt_ts(&now))
        .execute(ex)
        .await?;
    Ok(result.rows_affected())
}

/// Mark a job as completed.
pub async fn complete_job<'e, E>(ex: E, job_id: Uuid) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE jobs SET status = 'completed', updated_at = ? WHERE id = ?")
        .bind(fmt_ts(&Utc::now()))
        .bind(job_id.to_string())
        .execute(ex)
        .await?;
    Ok(())
}

/// Record a failure. The job returns to `pending` at `retry_at`, or is
/// dead-lettered once `max_attempts` is reached. Returns the updated row.
pub async fn fail_job<'e, E>(
    ex: E,
    job_id: Uuid,
    error: &str,
    retry_at: DateTime<Utc>,
) -> Result<JobRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        UPDATE jobs
        SET status = CASE WHEN attempts >= max_attempts THEN 'dead_lettered' ELSE 'pending' END,
            run_at = CASE WHEN attempts >= max_attempts THEN run_at ELSE ? END,
            last_error = ?,
            updated_at = ?
        WHERE id = ?
        RETURNING {COLUMNS}
        "#
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(fmt_ts(&retry_at))
        .bind(error)
        .bind(fmt_ts(&Utc::now()))
        .bind(job_id.to_string())
        .fetch_optional(ex)
        .await?
        .ok_or(DbError::NotFound)
}

/// Dead-letter a job immediately, e.g. when its payload cannot be decoded.
pub async fn dead_letter_job<'e, E>(ex: E, job_id: Uuid, error: &str) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE jobs SET status = 'dead_lettered', last_error = ?, updated_at = ? WHERE id = ?")
        .bind(error)
        .bind(fmt_ts(&Utc::now()))
        .bind(job_id.to_string())
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn get_job<'e, E>(ex: E, job_id: Uuid) -> Result<JobRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id.to_string())
        .fetch_optional(ex)
        .await?
        .ok_or(DbError::NotFound)
}

/// All jobs, oldest first.
pub async fn list_jobs<'e, E>(ex: E) -> Result<Vec<JobRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at, rowid");
    Ok(sqlx::query_as::<_, JobRow>(&sql).fetch_all(ex).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::repository::test_support::pool;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn only_due_jobs_are_fetched() {
        let (_dir, pool) = pool().await;
        let now = Utc::now();
        enqueue_job(&pool.writer, "advance", &json!({ "n": 1 }), now + Duration::minutes(5), 3)
            .await
            .unwrap();
        assert!(fetch_next_job(&pool, now).await.unwrap().is_none());

        let due = enqueue_job(&pool.writer, "advance", &json!({ "n": 2 }), now, 3).await.unwrap();
        let job = fetch_next_job(&pool, now).await.unwrap().unwrap();
        assert_eq!(job.id, due.id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        assert!(fetch_next_job(&pool, now).await.unwrap().is_none());
        complete_job(&pool.writer, job.id).await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_jobs_are_requeued() {
        let (_dir, pool) = pool().await;
        let now = Utc::now();
        enqueue_job(&pool.writer, "advance", &json!({}), now, 3).await.unwrap();
        let job = fetch_next_job(&pool, now).await.unwrap().unwrap();
        assert!(fetch_next_job(&pool, now).await.unwrap().is_none());

        assert_eq!(requeue_in_flight(&pool.writer, now).await.unwrap(), 1);
        let again = fetch_next_job(&pool, now).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);

        complete_job(&pool.writer, again.id).await.unwrap();
        assert_eq!(requeue_in_flight(&pool.writer, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered() {
        let (_dir, pool) = pool().await;
        let now = Utc::now();
        enqueue_job(&pool.writer, "advance", &json!({}), now, 2).await.unwrap();

        let job = fetch_next_job(&pool, now).await.unwrap().unwrap();
        let failed = fail_job(&pool.writer, job.id, "boom", now).await.unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let job = fetch_next_job(&pool, now).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        let failed = fail_job(&pool.writer, job.id, "boom again", now).await.unwrap();
        assert_eq!(failed.status, JobStatus::DeadLettered);

        assert!(fetch_next_job(&pool, now).await.unwrap().is_none());
        assert_eq!(list_jobs(&pool.reader).await.unwrap().len(), 1);
    }
}
