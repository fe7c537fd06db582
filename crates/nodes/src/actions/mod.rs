//! Built-in action implementations, one module per action type.
//!
//! Each parameter struct from [`crate::action`] implements
//! [`ExecutableAction`](crate::ExecutableAction) here.

mod chat;
mod email;
mod http;
mod inbox;
mod llm;

use std::time::Duration;

use crate::NodeError;

/// Map a transport error, keeping request URLs (which may embed tokens) out
/// of the message.
fn transport_error(e: reqwest::Error, timeout: Duration) -> NodeError {
    if e.is_timeout() {
        NodeError::Timeout(timeout)
    } else {
        NodeError::Http(e.without_url())
    }
}

/// A resolved parameter that must not be blank.
fn required(name: &'static str, value: String) -> Result<String, NodeError> {
    if value.trim().is_empty() {
        Err(NodeError::MissingParameter(name))
    } else {
        Ok(value)
    }
}
