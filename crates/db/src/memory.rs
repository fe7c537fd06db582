//! In-memory store for tests and single-process runs without a database.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{CredentialRow, ExecutionRecord, ExecutionUpdate, WorkflowRow};
use crate::store::{CredentialStore, ExecutionStore, WorkflowStore};
use crate::DbError;

/// Implements every store trait over plain maps.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRow>>,
    credentials: RwLock<Vec<CredentialRow>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workflow.
    pub fn insert_workflow(&self, workflow: WorkflowRow) {
        self.workflows.write().unwrap().insert(workflow.id, workflow);
    }

    pub fn remove_workflow(&self, id: Uuid) -> Option<WorkflowRow> {
        self.workflows.write().unwrap().remove(&id)
    }

    pub fn insert_credential(&self, credential: CredentialRow) {
        self.credentials.write().unwrap().push(credential);
    }

    /// Every execution record, oldest first.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        let mut all: Vec<_> = self.executions.read().unwrap().values().cloned().collect();
        all.sort_by_key(|r| r.started_at);
        all
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<CredentialRow>, DbError> {
        Ok(self
            .credentials
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        Ok(self.workflows.read().unwrap().get(&id).cloned())
    }

    async fn update(&self, workflow: &WorkflowRow) -> Result<(), DbError> {
        let mut workflows = self.workflows.write().unwrap();
        let stored = workflows.get_mut(&workflow.id).ok_or(DbError::NotFound)?;
        *stored = WorkflowRow {
            updated_at: Utc::now(),
            ..workflow.clone()
        };
        Ok(())
    }

    async fn find_active(&self) -> Result<Vec<WorkflowRow>, DbError> {
        Ok(self
            .workflows
            .read()
            .unwrap()
            .values()
            .filter(|w| w.active)
            .cloned()
            .collect())
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> Result<Vec<WorkflowRow>, DbError> {
        Ok(self
            .workflows
            .read()
            .unwrap()
            .values()
            .filter(|w| w.active && w.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        self.executions
            .write()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &ExecutionUpdate) -> Result<(), DbError> {
        let mut executions = self.executions.write().unwrap();
        let record = executions.get_mut(&id).ok_or(DbError::NotFound)?;
        update.apply(record);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<ExecutionRecord>, DbError> {
        Ok(self.executions.read().unwrap().get(&id).cloned())
    }
}
