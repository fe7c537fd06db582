//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Workflow nodes and edges stay opaque JSON here; the `engine` crate owns
//! their meaning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::DbError;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,
    /// JSON array of node objects.
    pub nodes: Value,
    /// JSON array of edge objects.
    pub edges: Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// credentials
// ---------------------------------------------------------------------------

/// A stored credential. `data` is the opaque provider payload.
#[derive(Clone, FromRow)]
pub struct CredentialRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub application: String,
    pub data: Value,
}

impl std::fmt::Debug for CredentialRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRow")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("application", &self.application)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED"    => Ok(Self::Queued),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Completed,
    Failed,
}

/// Outcome of one node within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    pub output: Value,
    pub executed_at: DateTime<Utc>,
}

/// One workflow run as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub user_id: Uuid,
    /// `manual|api|schedule|webhook|email`.
    pub triggered_by: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub node_results: Vec<NodeResult>,
    pub error: Option<String>,
    pub failed_node_id: Option<String>,
}

/// Fields an orchestrator may change after creating a record.
/// `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub node_results: Option<Vec<NodeResult>>,
    pub error: Option<String>,
    pub failed_node_id: Option<String>,
}

impl ExecutionUpdate {
    pub fn apply(&self, record: &mut ExecutionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if self.completed_at.is_some() {
            record.completed_at = self.completed_at;
        }
        if self.duration_ms.is_some() {
            record.duration_ms = self.duration_ms;
        }
        if let Some(results) = &self.node_results {
            record.node_results = results.clone();
        }
        if self.error.is_some() {
            record.error = self.error.clone();
        }
        if self.failed_node_id.is_some() {
            record.failed_node_id = self.failed_node_id.clone();
        }
    }
}

/// Raw `executions` row; status and node results are stored as text/JSON.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub user_id: Uuid,
    pub triggered_by: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub node_results: Value,
    pub error: Option<String>,
    pub failed_node_id: Option<String>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            workflow_name: row.workflow_name,
            user_id: row.user_id,
            triggered_by: row.triggered_by,
            status: row.status.parse().map_err(DbError::Decode)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            node_results: serde_json::from_value(row.node_results)
                .map_err(|e| DbError::Decode(e.to_string()))?,
            error: row.error,
            failed_node_id: row.failed_node_id,
        })
    }
}

// ---------------------------------------------------------------------------
// job_queue
// ---------------------------------------------------------------------------

/// A job row fetched from the queue table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub topic: String,
    pub priority: i16,
    pub status: String,
    pub payload: Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_text_round_trips_through_the_column_form() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn update_only_touches_set_fields() {
        let mut record = ExecutionRecord {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            workflow_name: "wf".into(),
            user_id: Uuid::new_v4(),
            triggered_by: "manual".into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            node_results: vec![],
            error: None,
            failed_node_id: None,
        };

        ExecutionUpdate {
            status: Some(ExecutionStatus::Failed),
            error: Some("boom".into()),
            failed_node_id: Some("b".into()),
            ..Default::default()
        }
        .apply(&mut record);

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.failed_node_id.as_deref(), Some("b"));
        assert_eq!(record.workflow_name, "wf");
        assert_eq!(serde_json::to_value(record.status).unwrap(), json!("FAILED"));
    }
}
