//! Trigger-subsystem error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("node error: {0}")]
    Node(#[from] nodes::NodeError),

    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry or monitor has been shut down.
    #[error("trigger subsystem is shut down")]
    ShutDown,
}
