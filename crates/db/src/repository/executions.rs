//! Execution record repository functions.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{ExecutionRecord, ExecutionRow, ExecutionUpdate},
    DbError,
};

/// Insert an execution record. A record with the same id is replaced, so a
/// redelivered job starts from a clean row.
pub async fn create_execution(pool: &PgPool, record: &ExecutionRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, workflow_name, user_id, triggered_by, status, started_at,
             completed_at, duration_ms, node_results, error, failed_node_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            duration_ms = EXCLUDED.duration_ms,
            node_results = EXCLUDED.node_results,
            error = EXCLUDED.error,
            failed_node_id = EXCLUDED.failed_node_id
        "#,
    )
    .bind(record.id)
    .bind(record.workflow_id)
    .bind(&record.workflow_name)
    .bind(record.user_id)
    .bind(&record.triggered_by)
    .bind(record.status.to_string())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_ms)
    .bind(serde_json::to_value(&record.node_results)?)
    .bind(&record.error)
    .bind(&record.failed_node_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Apply the set fields of `update`; unset fields keep their stored value.
///
/// Returns `DbError::NotFound` if no row was updated.
pub async fn update_execution(
    pool: &PgPool,
    execution_id: Uuid,
    update: &ExecutionUpdate,
) -> Result<(), DbError> {
    let node_results = update
        .node_results
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE executions SET
            status = COALESCE($1, status),
            completed_at = COALESCE($2, completed_at),
            duration_ms = COALESCE($3, duration_ms),
            node_results = COALESCE($4, node_results),
            error = COALESCE($5, error),
            failed_node_id = COALESCE($6, failed_node_id)
        WHERE id = $7
        "#,
    )
    .bind(update.status.map(|s| s.to_string()))
    .bind(update.completed_at)
    .bind(update.duration_ms)
    .bind(node_results)
    .bind(&update.error)
    .bind(&update.failed_node_id)
    .bind(execution_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Fetch a single execution record.
pub async fn get_execution(pool: &PgPool, execution_id: Uuid) -> Result<Option<ExecutionRecord>, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_id, workflow_name, user_id, triggered_by, status, started_at,
               completed_at, duration_ms, node_results, error, failed_node_id
        FROM executions
        WHERE id = $1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    row.map(ExecutionRecord::try_from).transpose()
}
