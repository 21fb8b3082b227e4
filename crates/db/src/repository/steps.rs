//! Run-step operations.
//!
//! Every transition is a conditional UPDATE on the expected current status;
//! callers learn from the returned `bool` whether they won the transition.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::{RunStepRow, StepStatus};
use crate::DbError;

const COLUMNS: &str = "id, run_id, step_id, position, step_type, status, attempt, recovered, wait_signal, signals, input, output, error, started_at, ended_at";

pub async fn insert_step<'e, E>(ex: E, step: &RunStepRow) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO run_steps
            (id, run_id, step_id, position, step_type, status, attempt, recovered, wait_signal, signals, input, output, error, started_at, ended_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(step.id.to_string())
    .bind(step.run_id.to_string())
    .bind(&step.step_id)
    .bind(i64::from(step.position))
    .bind(&step.step_type)
    .bind(step.status.as_str())
    .bind(i64::from(step.attempt))
    .bind(step.recovered)
    .bind(&step.wait_signal)
    .bind(serde_json::to_string(&step.signals)?)
    .bind(step.input.as_ref().map(serde_json::to_string).transpose()?)
    .bind(step.output.as_ref().map(serde_json::to_string).transpose()?)
    .bind(&step.error)
    .bind(step.started_at.as_ref().map(fmt_ts))
    .bind(step.ended_at.as_ref().map(fmt_ts))
    .execute(ex)
    .await
    .map_err(|e| DbError::from_insert(e, &format!("step {} already exists", step.step_id)))?;
    Ok(())
}

/// All steps of a run in declaration order.
pub async fn list_steps<'e, E>(ex: E, run_id: Uuid) -> Result<Vec<RunStepRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM run_steps WHERE run_id = ? ORDER BY position");
    Ok(sqlx::query_as::<_, RunStepRow>(&sql)
        .bind(run_id.to_string())
        .fetch_all(ex)
        .await?)
}

/// Steps of a run in one status, in declaration order.
pub async fn list_steps_with_status<'e, E>(
    ex: E,
    run_id: Uuid,
    status: StepStatus,
) -> Result<Vec<RunStepRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM run_steps WHERE run_id = ? AND status = ? ORDER BY position"
    );
    Ok(sqlx::query_as::<_, RunStepRow>(&sql)
        .bind(run_id.to_string())
        .bind(status.as_str())
        .fetch_all(ex)
        .await?)
}

pub async fn find_step<'e, E>(ex: E, run_id: Uuid, step_id: &str) -> Result<Option<RunStepRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM run_steps WHERE run_id = ? AND step_id = ?");
    Ok(sqlx::query_as::<_, RunStepRow>(&sql)
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(ex)
        .await?)
}

/// `running` steps whose run is not terminal. These are the orphans a crashed
/// dispatcher leaves behind.
pub async fn list_orphaned<'e, E>(ex: E) -> Result<Vec<RunStepRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM run_steps s JOIN runs r ON r.id = s.run_id
         WHERE s.status = 'running' AND r.status NOT IN ('completed', 'failed', 'cancelled')
         ORDER BY s.run_id, s.position",
        COLUMNS
            .split(", ")
            .map(|c| format!("s.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(sqlx::query_as::<_, RunStepRow>(&sql).fetch_all(ex).await?)
}

/// `pending → running`. A row flagged `recovered` keeps its pre-charged
/// attempt; every other claim increments it.
pub async fn claim<'e, E>(ex: E, run_id: Uuid, step_id: &str, now: DateTime<Utc>) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps
        SET status = 'running',
            attempt = CASE WHEN recovered = 1 THEN attempt ELSE attempt + 1 END,
            recovered = 0,
            error = NULL,
            started_at = ?,
            ended_at = NULL
        WHERE run_id = ? AND step_id = ? AND status = 'pending'
        "#,
    )
    .bind(fmt_ts(&now))
    .bind(run_id.to_string())
    .bind(step_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_input<'e, E>(ex: E, run_id: Uuid, step_id: &str, input: &Value) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE run_steps SET input = ? WHERE run_id = ? AND step_id = ?")
        .bind(serde_json::to_string(input)?)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(ex)
        .await?;
    Ok(())
}

/// `running → completed`.
pub async fn complete<'e, E>(
    ex: E,
    run_id: Uuid,
    step_id: &str,
    output: &Value,
    now: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps SET status = 'completed', output = ?, ended_at = ?
        WHERE run_id = ? AND step_id = ? AND status = 'running'
        "#,
    )
    .bind(serde_json::to_string(output)?)
    .bind(fmt_ts(&now))
    .bind(run_id.to_string())
    .bind(step_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `running → failed`.
pub async fn fail<'e, E>(
    ex: E,
    run_id: Uuid,
    step_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps SET status = 'failed', error = ?, ended_at = ?
        WHERE run_id = ? AND step_id = ? AND status = 'running'
        "#,
    )
    .bind(error)
    .bind(fmt_ts(&now))
    .bind(run_id.to_string())
    .bind(step_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `running → waiting_for_signal`, remembering the awaited signal name.
pub async fn park<'e, E>(
    ex: E,
    run_id: Uuid,
    step_id: &str,
    wait_signal: Option<&str>,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps SET status = 'waiting_for_signal', wait_signal = ?
        WHERE run_id = ? AND step_id = ? AND status = 'running'
        "#,
    )
    .bind(wait_signal)
    .bind(run_id.to_string())
    .bind(step_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `waiting_for_signal → pending`, leaving `attempt` untouched. When
/// `signals` is given it replaces the stored signal history.
pub async fn resume<'e, E>(
    ex: E,
    run_id: Uuid,
    step_id: &str,
    signals: Option<&Value>,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps
        SET status = 'pending', wait_signal = NULL, signals = COALESCE(?, signals)
        WHERE run_id = ? AND step_id = ? AND status = 'waiting_for_signal'
        "#,
    )
    .bind(signals.map(serde_json::to_string).transpose()?)
    .bind(run_id.to_string())
    .bind(step_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `running → pending` for a crash orphan: pre-charge the next attempt and
/// clear the timestamps.
pub async fn reclaim<'e, E>(ex: E, id: Uuid) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps
        SET status = 'pending', attempt = attempt + 1, recovered = 1, started_at = NULL, ended_at = NULL
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(id.to_string())
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Close every open step of a cancelled run: `pending` becomes `skipped`,
/// `running` and `waiting_for_signal` become `cancelled`.
pub async fn cancel_open<'e, E>(ex: E, run_id: Uuid, now: DateTime<Utc>) -> Result<u64, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE run_steps
        SET status = CASE WHEN status = 'pending' THEN 'skipped' ELSE 'cancelled' END,
            ended_at = COALESCE(ended_at, ?)
        WHERE run_id = ? AND status IN ('pending', 'running', 'waiting_for_signal')
        "#,
    )
    .bind(fmt_ts(&now))
    .bind(run_id.to_string())
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}
