//! Inbound signal log. Rows are never updated or deleted.

use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::models::SignalRow;
use crate::DbError;

pub async fn insert_signal<'e, E>(ex: E, signal: &SignalRow) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO signals (id, run_id, name, payload, handled, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(signal.id.to_string())
    .bind(signal.run_id.to_string())
    .bind(&signal.name)
    .bind(serde_json::to_string(&signal.payload)?)
    .bind(signal.handled)
    .bind(fmt_ts(&signal.created_at))
    .execute(ex)
    .await?;
    Ok(())
}

/// Signals of a run in arrival order.
pub async fn list_signals<'e, E>(ex: E, run_id: Uuid) -> Result<Vec<SignalRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_as::<_, SignalRow>(
        "SELECT id, run_id, name, payload, handled, created_at FROM signals WHERE run_id = ? ORDER BY created_at, rowid",
    )
    .bind(run_id.to_string())
    .fetch_all(ex)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{pool, seed_run};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn signals_are_listed_in_arrival_order() {
        let (_dir, pool) = pool().await;
        let run = seed_run(&pool, &[]).await;
        let now = Utc::now();

        for (i, name) in ["first", "second"].into_iter().enumerate() {
            insert_signal(
                &pool.writer,
                &SignalRow {
                    id: Uuid::new_v4(),
                    run_id: run.id,
                    name: name.into(),
                    payload: json!({ "n": i }),
                    handled: i == 0,
                    created_at: now,
                },
            )
            .await
            .unwrap();
        }

        let stored = list_signals(&pool.reader, run.id).await.unwrap();
        let names: Vec<_> = stored.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert!(stored[0].handled);
        assert!(!stored[1].handled);
        assert_eq!(stored[1].payload, json!({ "n": 1 }));
    }
}
