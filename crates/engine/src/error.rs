//! Engine-level error types.

use nodes::NodeError;
use thiserror::Error;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    /// An action node's payload failed validation.
    #[error("node '{node_id}' is invalid: {source}")]
    InvalidNode {
        node_id: String,
        #[source]
        source: NodeError,
    },

    /// Stored definition JSON has the wrong shape.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    // ------ Execution errors ------

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl EngineError {
    /// The node a validation error is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateNodeId(id) => Some(id),
            Self::UnknownNodeType { node_id, .. } | Self::InvalidNode { node_id, .. } => {
                Some(node_id)
            }
            _ => None,
        }
    }
}
