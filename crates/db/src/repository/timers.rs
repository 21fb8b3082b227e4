//! Durable wait timers.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Row, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::WaitTimerRow;
use crate::DbError;

const COLUMNS: &str = "id, run_id, step_id, trigger_at, payload, status, created_at, triggered_at";

pub async fn insert_timer<'e, E>(ex: E, timer: &WaitTimerRow) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO wait_timers (id, run_id, step_id, trigger_at, payload, status, created_at, triggered_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(timer.id.to_string())
    .bind(timer.run_id.to_string())
    .bind(&timer.step_id)
    .bind(fmt_ts(&timer.trigger_at))
    .bind(serde_json::to_string(&timer.payload)?)
    .bind(timer.status.as_str())
    .bind(fmt_ts(&timer.created_at))
    .bind(timer.triggered_at.as_ref().map(fmt_ts))
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn find_timer<'e, E>(ex: E, id: Uuid) -> Result<Option<WaitTimerRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM wait_timers WHERE id = ?");
    Ok(sqlx::query_as::<_, WaitTimerRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(ex)
        .await?)
}

/// `pending → triggered`. Returns `false` if the timer already fired.
pub async fn mark_triggered<'e, E>(ex: E, id: Uuid, now: DateTime<Utc>) -> Result<bool, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE wait_timers SET status = 'triggered', triggered_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(fmt_ts(&now))
    .bind(id.to_string())
    .execute(ex)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// How many timers of this step have fired.
pub async fn count_triggered<'e, E>(ex: E, run_id: Uuid, step_id: &str) -> Result<u32, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM wait_timers WHERE run_id = ? AND step_id = ? AND status = 'triggered'",
    )
    .bind(run_id.to_string())
    .bind(step_id)
    .fetch_one(ex)
    .await?;
    let n: i64 = row.try_get("n")?;
    Ok(u32::try_from(n).unwrap_or(u32::MAX))
}

/// Pending timers of this step, soonest first.
pub async fn list_pending_for_step<'e, E>(
    ex: E,
    run_id: Uuid,
    step_id: &str,
) -> Result<Vec<WaitTimerRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM wait_timers WHERE run_id = ? AND step_id = ? AND status = 'pending' ORDER BY trigger_at"
    );
    Ok(sqlx::query_as::<_, WaitTimerRow>(&sql)
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_all(ex)
        .await?)
}

/// Pending timers whose trigger time has passed, soonest first.
pub async fn list_due<'e, E>(ex: E, now: DateTime<Utc>) -> Result<Vec<WaitTimerRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM wait_timers WHERE status = 'pending' AND trigger_at <= ? ORDER BY trigger_at"
    );
    Ok(sqlx::query_as::<_, WaitTimerRow>(&sql)
        .bind(fmt_ts(&now))
        .fetch_all(ex)
        .await?)
}

pub async fn list_for_run<'e, E>(ex: E, run_id: Uuid) -> Result<Vec<WaitTimerRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM wait_timers WHERE run_id = ? ORDER BY created_at");
    Ok(sqlx::query_as::<_, WaitTimerRow>(&sql)
        .bind(run_id.to_string())
        .fetch_all(ex)
        .await?)
}
