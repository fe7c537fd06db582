//! The `ExecutableAction` trait: the contract every action type fulfils.

use async_trait::async_trait;
use serde_json::Value;

use crate::dispatcher::{ActionServices, ExecutionScope};
use crate::{Credential, NodeError};

/// Everything an action may read while it runs.
///
/// Borrowed from the dispatcher for the duration of one call; actions never
/// own execution state.
pub struct ActionContext<'a> {
    pub node_id: &'a str,
    /// All prior node outputs, plus `previousNode` when exactly one direct
    /// predecessor feeds this node. Template tokens resolve against this.
    pub prior_outputs: &'a Value,
    /// The credential resolved for this node, if the user has one.
    pub credential: Option<&'a Credential>,
    /// Application name the credential was looked up under.
    pub credential_app: Option<&'a str>,
    pub services: &'a ActionServices,
    pub scope: &'a ExecutionScope,
}

impl ActionContext<'_> {
    /// The node's credential, or [`NodeError::MissingCredential`].
    pub fn credential(&self) -> Result<&Credential, NodeError> {
        self.credential.ok_or_else(|| {
            NodeError::MissingCredential(self.credential_app.unwrap_or("unknown").to_owned())
        })
    }

    /// Resolve `{{…}}` tokens in `template` against the prior outputs.
    pub fn resolve(&self, template: &str) -> String {
        crate::resolver::resolve_str(template, self.prior_outputs)
    }
}

/// One action type's execution.
///
/// Implementations receive parameters that already passed validation and
/// return the node's JSON output.
#[async_trait]
pub trait ExecutableAction: Send + Sync {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError>;
}
