//! Compensation records.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::{CompensationRow, CompensationStatus};
use crate::DbError;

pub async fn insert_compensation<'e, E>(ex: E, row: &CompensationRow) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO compensations (id, run_id, step_id, action, status, payload, error, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(row.run_id.to_string())
    .bind(&row.step_id)
    .bind(&row.action)
    .bind(row.status.as_str())
    .bind(serde_json::to_string(&row.payload)?)
    .bind(&row.error)
    .bind(fmt_ts(&row.created_at))
    .bind(fmt_ts(&row.updated_at))
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn update_status<'e, E>(
    ex: E,
    id: Uuid,
    status: CompensationStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE compensations SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(fmt_ts(&now))
        .bind(id.to_string())
        .execute(ex)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Compensations of a run in the order they were attempted.
pub async fn list_for_run<'e, E>(ex: E, run_id: Uuid) -> Result<Vec<CompensationRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_as::<_, CompensationRow>(
        r#"
        SELECT id, run_id, step_id, action, status, payload, error, created_at, updated_at
        FROM compensations WHERE run_id = ? ORDER BY created_at, rowid
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(ex)
    .await?)
}
