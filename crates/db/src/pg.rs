//! Postgres implementation of the store traits.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CredentialRow, ExecutionRecord, ExecutionUpdate, WorkflowRow};
use crate::repository::{credentials, executions, workflows};
use crate::store::{CredentialStore, ExecutionStore, WorkflowStore};
use crate::{DbError, DbPool};

/// Thin adapter from the store traits onto the repository functions.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<CredentialRow>, DbError> {
        credentials::list_by_user(&self.pool, user_id).await
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn update(&self, workflow: &WorkflowRow) -> Result<(), DbError> {
        workflows::update_workflow(&self.pool, workflow).await
    }

    async fn find_active(&self) -> Result<Vec<WorkflowRow>, DbError> {
        workflows::list_active(&self.pool).await
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Vec<WorkflowRow>, DbError> {
        workflows::list_active_by_user(&self.pool, user_id).await
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        executions::create_execution(&self.pool, record).await
    }

    async fn update(&self, id: Uuid, update: &ExecutionUpdate) -> Result<(), DbError> {
        executions::update_execution(&self.pool, id, update).await
    }

    async fn find(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DbError> {
        executions::get_execution(&self.pool, id).await
    }
}
