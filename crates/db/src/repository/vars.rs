//! Per-run variable store. Last write wins per `(run_id, key)`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::RunVarRow;
use crate::DbError;

pub async fn upsert_var<'e, E>(
    ex: E,
    run_id: Uuid,
    key: &str,
    value: &Value,
    now: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO run_vars (run_id, key, value, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (run_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(run_id.to_string())
    .bind(key)
    .bind(serde_json::to_string(value)?)
    .bind(fmt_ts(&now))
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn list_vars<'e, E>(ex: E, run_id: Uuid) -> Result<Vec<RunVarRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_as::<_, RunVarRow>(
        "SELECT run_id, key, value, updated_at FROM run_vars WHERE run_id = ? ORDER BY key",
    )
    .bind(run_id.to_string())
    .fetch_all(ex)
    .await?)
}

pub async fn get_var<'e, E>(ex: E, run_id: Uuid, key: &str) -> Result<Option<RunVarRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_as::<_, RunVarRow>(
        "SELECT run_id, key, value, updated_at FROM run_vars WHERE run_id = ? AND key = ?",
    )
    .bind(run_id.to_string())
    .bind(key)
    .fetch_optional(ex)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{pool, seed_run};
    use serde_json::json;

    #[tokio::test]
    async fn last_write_wins() {
        let (_dir, pool) = pool().await;
        let run = seed_run(&pool, &[]).await;

        upsert_var(&pool.writer, run.id, "total", &json!(10), Utc::now()).await.unwrap();
        upsert_var(&pool.writer, run.id, "total", &json!(25), Utc::now()).await.unwrap();
        upsert_var(&pool.writer, run.id, "a", &json!("x"), Utc::now()).await.unwrap();

        let vars = list_vars(&pool.reader, run.id).await.unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].key, "a");

        let total = get_var(&pool.reader, run.id, "total").await.unwrap().unwrap();
        assert_eq!(total.value, json!(25));
        assert!(get_var(&pool.reader, run.id, "missing").await.unwrap().is_none());
    }
}
