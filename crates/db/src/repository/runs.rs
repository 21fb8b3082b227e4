//! Run operations.
//!
//! Status writes are conditional on the run not being terminal, so a late
//! writer can never resurrect a completed, failed or cancelled run.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::{RunRow, RunStatus};
use crate::DbError;

const COLUMNS: &str = "id, workflow_id, version, status, tenant, caller, inputs, error, started_at, ended_at, created_at";

const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed', 'cancelled')";

pub async fn insert_run<'e, E>(ex: E, run: &RunRow) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO runs (id, workflow_id, version, status, tenant, caller, inputs, error, started_at, ended_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.id.to_string())
    .bind(run.workflow_id.to_string())
    .bind(&run.version)
    .bind(run.status.as_str())
    .bind(&run.tenant)
    .bind(&run.caller)
    .bind(serde_json::to_string(&run.inputs)?)
    .bind(&run.error)
    .bind(run.started_at.as_ref().map(fmt_ts))
    .bind(run.ended_at.as_ref().map(fmt_ts))
    .bind(fmt_ts(&run.created_at))
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn find_run<'e, E>(ex: E, id: Uuid) -> Result<Option<RunRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE id = ?");
    Ok(sqlx::query_as::<_, RunRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(ex)
        .await?)
}

pub async fn get_run<'e, E>(ex: E, id: Uuid) -> Result<RunRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    find_run(ex, id).await?.ok_or(DbError::NotFound)
}

/// Runs of one workflow, newest first.
pub async fn list_runs_for_workflow<'e, E>(ex: E, workflow_id: Uuid) -> Result<Vec<RunRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM runs WHERE workflow_id = ? ORDER BY created_at DESC");
    Ok(sqlx::query_as::<_, RunRow>(&sql)
        .bind(workflow_id.to_string())
        .fetch_all(ex)
        .await?)
}

/// Runs that are `pending` or `running`, plus parked runs that still hold a
/// `pending` step (a signal or timer resumed it), oldest first. After a
/// crash these may have ready steps nobody is driving.
pub async fn list_active_runs<'e, E>(ex: E) -> Result<Vec<RunRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM runs
        WHERE status IN ('pending', 'running')
           OR (status = 'waiting_for_signal'
               AND EXISTS (SELECT 1 FROM run_steps s WHERE s.run_id = runs.id AND s.status = 'pending'))
        ORDER BY created_at
        "#
    );
    Ok(sqlx::query_as::<_, RunRow>(&sql).fetch_all(ex).await?)
}

/// Move a `pending` or `waiting_for_signal` run to `running`, stamping
/// `started_at` the first time. Returns `true` if the row changed.
pub async fn mark_running<'e, E>(ex: E, id: Uuid, now: DateTime<Utc>) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'running', started_at = COALESCE(started_at, ?)
        WHERE id = ? AND status IN ('pending', 'waiting_for_signal')
        "#,
    )
    .bind(fmt_ts(&now))
    .bind(id.to_string())
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Set a non-terminal status (`running` / `waiting_for_signal`) on a run that
/// is not yet terminal.
pub async fn set_status<'e, E>(ex: E, id: Uuid, status: RunStatus) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    debug_assert!(!status.is_terminal(), "use `finish` for terminal statuses");
    let sql = format!("UPDATE runs SET status = ? WHERE id = ? AND {NOT_TERMINAL}");
    let result = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(id.to_string())
        .execute(ex)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a run into a terminal status, recording `ended_at` and an optional
/// error. A run that is already terminal is left untouched (`false`).
pub async fn finish<'e, E>(
    ex: E,
    id: Uuid,
    status: RunStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    debug_assert!(status.is_terminal(), "use `set_status` for non-terminal statuses");
    let sql = format!(
        "UPDATE runs SET status = ?, error = COALESCE(?, error), ended_at = ? WHERE id = ? AND {NOT_TERMINAL}"
    );
    let result = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(error)
        .bind(fmt_ts(&now))
        .bind(id.to_string())
        .execute(ex)
        .await?;
    Ok(result.rows_affected() == 1)
}
