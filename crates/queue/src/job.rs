//! The `JobQueue` trait and the envelope types shared by every backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Scheduling priority of a job. Higher priorities are dequeued first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used by table-backed queues (`ORDER BY priority DESC`).
    pub fn rank(self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            r if r >= 2 => Self::High,
            1 => Self::Normal,
            _ => Self::Low,
        }
    }
}

/// Options accepted by [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-supplied job id. A random one is generated when `None`.
    pub job_id: Option<String>,
    pub priority: Priority,
}

impl EnqueueOptions {
    pub fn with_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            priority: Priority::Normal,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A job handed to a consumer.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub payload: T,
}

/// A work queue shared between producers and a pool of consumers.
///
/// Implementations must hand each job to exactly one consumer and must treat
/// an `enqueue` whose `job_id` is already waiting as a no-op.
#[async_trait]
pub trait JobQueue<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Add a job and return its id.
    async fn enqueue(&self, payload: T, options: EnqueueOptions) -> Result<String, QueueError>;

    /// Wait for the next job. Returns `None` once the queue is closed and drained.
    ///
    /// Must be cancel safe: dropping the future before it resolves leaves
    /// every job available to other consumers.
    async fn dequeue(&self) -> Result<Option<Job<T>>, QueueError>;

    /// Record that a dequeued job finished. In-memory queues forget jobs on
    /// dequeue, so the default does nothing.
    async fn complete(&self, _job_id: &str) -> Result<(), QueueError> {
        Ok(())
    }

    /// Record that a dequeued job failed. Jobs are never redelivered.
    async fn fail(&self, _job_id: &str, _error: &str) -> Result<(), QueueError> {
        Ok(())
    }
}
