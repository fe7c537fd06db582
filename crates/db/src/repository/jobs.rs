//! Job queue repository functions.
//!
//! The queue is backed by the `job_queue` Postgres table, partitioned by
//! `topic`. Workers poll the table and use `SELECT … FOR UPDATE SKIP LOCKED`
//! for safe concurrent processing.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::JobRow, DbError};

const COLUMNS: &str = "id, topic, priority, status, payload, last_error, created_at, updated_at";

/// Enqueue a job under a caller-chosen id.
///
/// Returns `false` when a job with this id already exists (nothing is written).
pub async fn enqueue_job(
    pool: &PgPool,
    topic: &str,
    job_id: &str,
    priority: i16,
    payload: serde_json::Value,
) -> Result<bool, DbError> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO job_queue (id, topic, priority, status, payload, created_at, updated_at)
        VALUES ($1, $2, $3, 'pending', $4, $5, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(topic)
    .bind(priority)
    .bind(payload)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Atomically fetch the next pending job of `topic` and mark it `processing`.
///
/// Highest priority first, oldest first within a priority.
/// Returns `None` if no pending jobs exist.
pub async fn fetch_next_job(pool: &PgPool, topic: &str) -> Result<Option<JobRow>, DbError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM job_queue
        WHERE status = 'pending' AND topic = $1
        ORDER BY priority DESC, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(topic)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref job) = row {
        sqlx::query("UPDATE job_queue SET status = 'processing', updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    } else {
        tx.rollback().await?;
    }

    Ok(row)
}

/// Put a `processing` job back to `pending` so another worker can claim it.
pub async fn release_job(pool: &PgPool, job_id: &str) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE job_queue SET status = 'pending', updated_at = $1 WHERE id = $2 AND status = 'processing'",
    )
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a job as completed.
pub async fn complete_job(pool: &PgPool, job_id: &str) -> Result<(), DbError> {
    sqlx::query("UPDATE job_queue SET status = 'completed', updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a job as failed. Failed jobs are kept for inspection, never retried.
pub async fn fail_job(pool: &PgPool, job_id: &str, error: &str) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE job_queue SET status = 'failed', last_error = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}
