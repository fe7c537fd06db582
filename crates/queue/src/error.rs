//! Queue-level error type.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed and will not hand out more jobs.
    #[error("queue is closed")]
    Closed,

    /// No correlated result arrived before the deadline.
    #[error("task '{task_id}' timed out after {after:?}")]
    Timeout { task_id: String, after: Duration },

    /// The consumer dropped the task without publishing a result.
    #[error("task '{0}' was abandoned before completing")]
    Abandoned(String),

    /// Failure in the underlying transport (database, broker, …).
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
