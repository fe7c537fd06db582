//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and an execution
//! job look like in memory. Workflows round-trip through the `nodes`/`edges`
//! JSON columns of the `workflows` table; jobs round-trip through the job
//! queue.

use std::fmt;

use chrono::{DateTime, Utc};
use db::models::WorkflowRow;
use queue::Priority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// One node as drawn by the editor. `node_type` discriminates trigger
/// variants from the generic `action` variant; `data` is the type-specific
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Display-only, ignored by execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

/// Directed edge `source → target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
}

impl EdgeData {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub nodes: Vec<NodeData>,
    #[serde(default)]
    pub edges: Vec<EdgeData>,
}

impl WorkflowDefinition {
    /// Decode the JSON columns of a stored workflow.
    ///
    /// # Errors
    /// [`EngineError::InvalidDefinition`] when `nodes` or `edges` don't have
    /// the expected shape.
    pub fn from_row(row: &WorkflowRow) -> Result<Self, EngineError> {
        let decode = |what: &str, e: serde_json::Error| {
            EngineError::InvalidDefinition(format!("workflow {} {what}: {e}", row.id))
        };

        Ok(Self {
            id: row.id,
            name: row.name.clone(),
            active: row.active,
            nodes: serde_json::from_value(row.nodes.clone()).map_err(|e| decode("nodes", e))?,
            edges: if row.edges.is_null() {
                Vec::new()
            } else {
                serde_json::from_value(row.edges.clone()).map_err(|e| decode("edges", e))?
            },
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeData> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes of one `type`, in definition order.
    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a NodeData> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }
}

// ---------------------------------------------------------------------------
// Execution job
// ---------------------------------------------------------------------------

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggeredBy {
    Manual,
    Api,
    Schedule,
    Webhook,
    Email,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Api => "api",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state carried on the job envelope itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

/// Trigger payload: webhook request parts or the matched email.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_data: Option<Value>,
}

/// Where a job came from; schedule jobs add the tick context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// The payload every trigger source places on the execution queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub triggered_by: TriggeredBy,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Snapshot of the definition taken when the job was created.
    pub workflow: WorkflowDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<TriggerData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl ExecutionJob {
    /// A fresh queued job with a new execution id.
    pub fn new(workflow: WorkflowDefinition, user_id: Uuid, triggered_by: TriggeredBy) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow.id,
            user_id,
            triggered_by,
            triggered_at: Utc::now(),
            status: JobStatus::Queued,
            priority: Priority::Normal,
            workflow,
            trigger_data: None,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trigger_data(mut self, trigger_data: TriggerData) -> Self {
        self.trigger_data = Some(trigger_data);
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
