//! Workflow lookups and updates.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::WorkflowRow, DbError};

const COLUMNS: &str = "id, user_id, name, active, nodes, edges, updated_at";

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {COLUMNS} FROM workflows WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Overwrite the mutable columns of a workflow.
///
/// Returns `DbError::NotFound` if no row was updated.
pub async fn update_workflow(pool: &PgPool, workflow: &WorkflowRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET name = $1, active = $2, nodes = $3, edges = $4, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(&workflow.name)
    .bind(workflow.active)
    .bind(&workflow.nodes)
    .bind(&workflow.edges)
    .bind(Utc::now())
    .bind(workflow.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// All active workflows, oldest update first.
pub async fn list_active(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {COLUMNS} FROM workflows WHERE active ORDER BY updated_at ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Active workflows owned by one user.
pub async fn list_active_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {COLUMNS} FROM workflows WHERE active AND user_id = $1 ORDER BY updated_at ASC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
