//! Store contracts consumed by the engine and the trigger subsystems.
//!
//! Both the in-memory store and the Postgres store implement these, so the
//! engine never knows which backend it talks to.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{CredentialRow, ExecutionRecord, ExecutionUpdate, WorkflowRow};
use crate::DbError;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Every credential owned by `user_id`.
    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<CredentialRow>, DbError>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError>;

    /// Overwrite name, active flag, nodes and edges of an existing workflow.
    ///
    /// # Errors
    /// [`DbError::NotFound`] when no workflow has this id.
    async fn update(&self, workflow: &WorkflowRow) -> Result<(), DbError>;

    async fn find_active(&self) -> Result<Vec<WorkflowRow>, DbError>;

    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Vec<WorkflowRow>, DbError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a record, replacing any earlier record with the same id.
    async fn create(&self, record: &ExecutionRecord) -> Result<(), DbError>;

    /// # Errors
    /// [`DbError::NotFound`] when no record has this id.
    async fn update(&self, id: Uuid, update: &ExecutionUpdate) -> Result<(), DbError>;

    async fn find(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DbError>;
}
