//! `nodes` crate: everything that happens *inside* one action node.
//!
//! - [`resolver`] threads prior node outputs into parameters via `{{path}}` tokens.
//! - [`action`] is the closed set of action types with typed parameters.
//! - [`dispatcher::ActionDispatcher`] routes an action to its [`ExecutableAction`] impl.
//! - [`ai`] hands LLM calls to a bounded worker pool and waits for the result.
//! - [`mail`] is the normalized inbox message shape shared with the inbox monitor.

pub mod action;
pub mod actions;
pub mod ai;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod mail;
pub mod mock;
pub mod resolver;
pub mod traits;

pub use action::{Action, ActionNode, ProviderKind};
pub use credentials::{Credential, CredentialMap};
pub use dispatcher::{ActionDispatcher, ActionServices, DispatcherConfig, ExecutionScope};
pub use error::NodeError;
pub use traits::{ActionContext, ExecutableAction};
