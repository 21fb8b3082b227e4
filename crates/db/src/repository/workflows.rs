//! Workflow definition operations. Definitions are immutable once inserted.

use sqlx::{Executor, Sqlite};
use uuid::Uuid;

use crate::codec::fmt_ts;
use crate::{models::WorkflowDefRow, DbError};

const COLUMNS: &str =
    "id, name, version, definition_text, compiled_dag, created_by, created_at";

/// Insert a new workflow definition.
///
/// Returns `DbError::Conflict` when `(name, version)` is already registered.
pub async fn insert_workflow<'e, E>(ex: E, row: &WorkflowDefRow) -> Result<WorkflowDefRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO workflow_defs (id, name, version, definition_text, compiled_dag, created_by, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id.to_string())
    .bind(&row.name)
    .bind(&row.version)
    .bind(&row.definition_text)
    .bind(serde_json::to_string(&row.compiled_dag)?)
    .bind(&row.created_by)
    .bind(fmt_ts(&row.created_at))
    .execute(ex)
    .await
    .map_err(|e| {
        DbError::from_insert(e, &format!("workflow {}@{} already exists", row.name, row.version))
    })?;

    Ok(row.clone())
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow<'e, E>(ex: E, id: Uuid) -> Result<WorkflowDefRow, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM workflow_defs WHERE id = ?");
    sqlx::query_as::<_, WorkflowDefRow>(&sql)
        .bind(id.to_string())
        .fetch_optional(ex)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn find_by_name_version<'e, E>(
    ex: E,
    name: &str,
    version: &str,
) -> Result<Option<WorkflowDefRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {COLUMNS} FROM workflow_defs WHERE name = ? AND version = ?");
    Ok(sqlx::query_as::<_, WorkflowDefRow>(&sql)
        .bind(name)
        .bind(version)
        .fetch_optional(ex)
        .await?)
}

/// Return workflows ordered by creation time (newest first), optionally
/// filtered by name and/or version.
pub async fn list_workflows<'e, E>(
    ex: E,
    name: Option<&str>,
    version: Option<&str>,
) -> Result<Vec<WorkflowDefRow>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM workflow_defs
         WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR version = ?2)
         ORDER BY created_at DESC"
    );
    Ok(sqlx::query_as::<_, WorkflowDefRow>(&sql)
        .bind(name)
        .bind(version)
        .fetch_all(ex)
        .await?)
}
