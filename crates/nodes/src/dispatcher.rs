//! Routes a validated action node to its implementation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::ai::AiTaskClient;
use crate::mail::InboxWatch;
use crate::traits::{ActionContext, ExecutableAction};
use crate::{Action, ActionNode, CredentialMap, NodeError};

/// Timeouts and provider endpoints used by the built-in actions.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Generic HTTP action request timeout.
    pub http_timeout: Duration,
    /// Chat-message API timeout.
    pub chat_timeout: Duration,
    /// How long an inbox-read action waits for a message.
    pub inbox_wait: Duration,
    /// How long an LLM action waits for the worker pool's result.
    pub ai_timeout: Duration,
    pub chat_base_url: String,
    pub email_base_url: String,
    pub openai_base_url: String,
    pub openrouter_base_url: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            chat_timeout: Duration::from_secs(10),
            inbox_wait: Duration::from_secs(5 * 60),
            ai_timeout: Duration::from_secs(120),
            chat_base_url: "https://api.telegram.org".into(),
            email_base_url: "https://api.resend.com".into(),
            openai_base_url: "https://api.openai.com/v1".into(),
            openrouter_base_url: "https://openrouter.ai/api/v1".into(),
        }
    }
}

/// Process-wide collaborators shared by every execution.
pub struct ActionServices {
    pub http: reqwest::Client,
    /// Producer side of the AI correlator; LLM actions fail without it.
    pub ai: Option<AiTaskClient>,
    /// Inbox monitor; inbox-read actions fail without it.
    pub inbox: Option<Arc<dyn InboxWatch>>,
    pub config: DispatcherConfig,
}

impl ActionServices {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            ai: None,
            inbox: None,
            config,
        }
    }

    pub fn with_ai(mut self, ai: AiTaskClient) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_inbox(mut self, inbox: Arc<dyn InboxWatch>) -> Self {
        self.inbox = Some(inbox);
        self
    }
}

impl Default for ActionServices {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

/// Identity of the run an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionScope {
    pub execution_id: Uuid,
    pub user_id: Uuid,
}

/// Per-execution dispatcher.
///
/// Built fresh for every run with that run's credential map; never shared
/// between executions.
pub struct ActionDispatcher {
    services: Arc<ActionServices>,
    credentials: Arc<CredentialMap>,
    scope: ExecutionScope,
}

impl ActionDispatcher {
    pub fn new(
        services: Arc<ActionServices>,
        credentials: Arc<CredentialMap>,
        scope: ExecutionScope,
    ) -> Self {
        Self {
            services,
            credentials,
            scope,
        }
    }

    /// Execute one action node against the outputs produced so far.
    ///
    /// Every failure comes back as [`NodeError::ActionFailed`]. Nothing is
    /// retried.
    #[instrument(
        skip(self, node, prior_outputs),
        fields(execution_id = %self.scope.execution_id, action = node.action.tag())
    )]
    pub async fn execute(
        &self,
        node_id: &str,
        node: &ActionNode,
        prior_outputs: &Value,
    ) -> Result<Value, NodeError> {
        let credential_app = node
            .credential
            .as_deref()
            .or_else(|| node.action.default_credential());
        let credential = credential_app.and_then(|app| self.credentials.get(app));
        debug!(
            credential = credential_app,
            found = credential.is_some(),
            "dispatching action"
        );

        let ctx = ActionContext {
            node_id,
            prior_outputs,
            credential,
            credential_app,
            services: &self.services,
            scope: &self.scope,
        };

        let result = match &node.action {
            Action::Http(params) => params.execute(&ctx).await,
            Action::Chat(params) => params.execute(&ctx).await,
            Action::Email(params) => params.execute(&ctx).await,
            Action::InboxRead(params) => params.execute(&ctx).await,
            Action::Llm(params) => params.execute(&ctx).await,
        };

        result.map_err(|e| {
            warn!(error = %e, "action failed");
            NodeError::ActionFailed {
                source: Box::new(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher(credentials: CredentialMap) -> ActionDispatcher {
        ActionDispatcher::new(
            Arc::new(ActionServices::default()),
            Arc::new(credentials),
            ExecutionScope {
                execution_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
        )
    }

    #[tokio::test]
    async fn missing_credential_is_wrapped_uniformly() {
        let node = ActionNode::from_data(&json!({
            "actionType": "ResendNodeType",
            "parameters": { "from": "a@b.c", "to": "d@e.f", "subject": "s", "html": "<p/>" }
        }))
        .unwrap();

        let err = dispatcher(CredentialMap::new())
            .execute("email-1", &node, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "action execution failed: no 'resend' credential configured"
        );
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn llm_without_worker_pool_fails_instead_of_hanging() {
        let node = ActionNode::from_data(&json!({
            "actionType": "openAiNodeType",
            "parameters": { "prompt": "hi" }
        }))
        .unwrap();
        let creds: CredentialMap = [crate::Credential::new("openai", json!({ "apiKey": "sk" }))]
            .into_iter()
            .collect();

        let err = dispatcher(creds)
            .execute("llm-1", &node, &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::ActionFailed { .. }));
    }
}
