//! Credential lookups. Credentials are written by the CRUD layer, never here.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::CredentialRow, DbError};

/// Every credential owned by `user_id`.
pub async fn list_by_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<CredentialRow>, DbError> {
    let rows = sqlx::query_as::<_, CredentialRow>(
        "SELECT id, user_id, application, data FROM credentials WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
