//! Lifecycle events published while an execution runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use queue::EventBus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::ExecutionJob;

/// Bus channel carrying [`LifecycleEvent`]s.
pub const WORKFLOW_EVENT_CHANNEL: &str = "workflow.event";

/// `node_id` used for whole-run start/end events.
pub const WORKFLOW_NODE_ID: &str = "workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub user_id: Uuid,
    pub node_id: String,
    pub time_stamp: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LifecycleEvent {
    pub fn for_job(job: &ExecutionJob, node_id: &str, status: EventStatus) -> Self {
        Self {
            execution_id: job.execution_id,
            workflow_id: job.workflow_id,
            workflow_name: job.workflow.name.clone(),
            user_id: job.user_id,
            node_id: node_id.to_owned(),
            time_stamp: Utc::now(),
            status,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Best-effort publisher: a bus failure is logged and never fails a run.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, event: LifecycleEvent) {
        let node_id = event.node_id.clone();
        let message = match serde_json::to_value(&event) {
            Ok(message) => message,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "could not encode lifecycle event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(WORKFLOW_EVENT_CHANNEL, message).await {
            warn!(
                execution_id = %event.execution_id,
                node_id = %node_id,
                error = %e,
                "failed to publish lifecycle event"
            );
        }
    }
}
