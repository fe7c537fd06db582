use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{required, transport_error};
use crate::action::{tags, ChatParams};
use crate::{resolver, ActionContext, ExecutableAction, NodeError};

#[async_trait]
impl ExecutableAction for ChatParams {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError> {
        let config = &ctx.services.config;
        let credential = ctx.credential()?;
        let token = credential.require("accessToken")?;
        let base_url = credential
            .field("baseUrl")
            .unwrap_or(config.chat_base_url.as_str())
            .trim_end_matches('/');

        let chat_id = match resolver::resolve(&self.chat_id, ctx.prior_outputs) {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let chat_id = normalize_chat_id(&required("chatId", chat_id)?);
        let message = required("message", ctx.resolve(&self.message))?;

        let mut payload = json!({ "chat_id": chat_id, "text": message });
        if let Some(mode) = self
            .parse_mode
            .as_deref()
            .filter(|m| !m.is_empty() && *m != "None")
        {
            payload["parse_mode"] = json!(mode);
        }

        let reply: Value = ctx
            .services
            .http
            .post(format!("{base_url}/bot{token}/sendMessage"))
            .timeout(config.chat_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(e, config.chat_timeout))?
            .json()
            .await
            .map_err(|e| transport_error(e, config.chat_timeout))?;

        if reply["ok"] != Value::Bool(true) {
            return Err(NodeError::Api {
                service: "Telegram",
                message: reply["description"]
                    .as_str()
                    .unwrap_or("request rejected")
                    .to_owned(),
            });
        }

        let result = &reply["result"];
        let sent_at = result["date"]
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        Ok(json!({
            "success": true,
            "sentAt": sent_at.to_rfc3339(),
            "actionType": tags::CHAT,
            "data": {
                "messageId": result["message_id"],
                "chatId": result["chat"]["id"],
                "payload": payload,
            },
        }))
    }
}

/// Usernames get an `@`; numeric ids (including negative group ids) pass.
fn normalize_chat_id(raw: &str) -> String {
    let id = raw.trim();
    if id.starts_with('@') || id.parse::<i64>().is_ok() {
        id.to_owned()
    } else {
        format!("@{id}")
    }
}
