use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::action::{tags, InboxReadParams};
use crate::mail::{InboxWaitRequest, MailFilter, MailboxAccount};
use crate::{ActionContext, ExecutableAction, NodeError};

#[async_trait]
impl ExecutableAction for InboxReadParams {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError> {
        let account = MailboxAccount::from_credential(ctx.credential()?)?;
        let inbox = ctx
            .services
            .inbox
            .as_ref()
            .ok_or_else(|| NodeError::Mailbox("no inbox monitor is running".into()))?;
        let wait = ctx.services.config.inbox_wait;

        let request = InboxWaitRequest {
            user_id: ctx.scope.user_id,
            execution_id: ctx.scope.execution_id,
            account,
            filter: MailFilter::from(self),
        };

        match tokio::time::timeout(wait, inbox.wait_for_message(request)).await {
            Ok(Ok(message)) => Ok(json!({
                "success": true,
                "sentAt": Utc::now().to_rfc3339(),
                "actionType": tags::INBOX_READ,
                "content": message.body,
                "subject": message.subject,
                "from": message.from,
                "data": message,
                "message": "Latest email received successfully",
            })),
            Ok(Err(e)) => Err(e),
            // Elapsing is a soft result, not a failure.
            Err(_) => {
                info!(node_id = ctx.node_id, waited_secs = wait.as_secs(), "no email arrived");
                Ok(json!({
                    "success": false,
                    "message": format!("No email received within {} minutes", wait.as_secs() / 60),
                    "waitedFor": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        }
    }
}
