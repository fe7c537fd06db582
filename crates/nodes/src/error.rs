//! Node-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned while validating or executing an action node.
///
/// None of these are retried. The dispatcher wraps whatever an action returns
/// in [`NodeError::ActionFailed`] so callers see one uniform message prefix.
#[derive(Debug, Error)]
pub enum NodeError {
    // ------ Validation errors ------
    /// The `actionType` tag is not one this engine knows.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// The parameter bag does not deserialize into the action's parameter struct.
    #[error("invalid parameters for {action}: {message}")]
    InvalidParameters {
        action: &'static str,
        message: String,
    },

    /// A required parameter resolved to nothing.
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter {
        name: &'static str,
        message: String,
    },

    /// The owning user has no credential for this application.
    #[error("no '{0}' credential configured")]
    MissingCredential(String),

    #[error("'{application}' credential has no '{field}'")]
    MissingCredentialField {
        application: String,
        field: &'static str,
    },

    // ------ External-call errors ------
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote service answered, but with an error.
    #[error("{service} API error: {message}")]
    Api {
        service: &'static str,
        message: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("mailbox error: {0}")]
    Mailbox(String),

    #[error("AI task failed: {0}")]
    AiTask(String),

    /// Uniform wrapper applied by the dispatcher around every action failure.
    #[error("action execution failed: {source}")]
    ActionFailed {
        #[source]
        source: Box<NodeError>,
    },
}

impl NodeError {
    /// True for errors raised before any external effect happened.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::UnsupportedAction(_)
            | Self::InvalidParameters { .. }
            | Self::MissingParameter(_)
            | Self::InvalidParameter { .. }
            | Self::MissingCredential(_)
            | Self::MissingCredentialField { .. } => true,
            Self::ActionFailed { source } => source.is_validation(),
            _ => false,
        }
    }
}
