use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{required, transport_error};
use crate::action::{tags, EmailParams};
use crate::{resolver, ActionContext, ExecutableAction, NodeError};

#[async_trait]
impl ExecutableAction for EmailParams {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError> {
        let config = &ctx.services.config;
        let api_key = ctx.credential()?.require("apiKey")?;

        let to = recipients(&resolver::resolve(&self.to, ctx.prior_outputs), ctx.prior_outputs);
        if to.is_empty() {
            return Err(NodeError::MissingParameter("to"));
        }
        let from = required("from", ctx.resolve(&self.from))?;
        let subject = required("subject", ctx.resolve(&self.subject))?;
        let html = required("html", ctx.resolve(&self.html))?;

        let mut body = Map::new();
        body.insert("from".into(), json!(from));
        body.insert("to".into(), json!(to));
        body.insert("subject".into(), json!(subject));
        body.insert("html".into(), json!(html));
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            body.insert("text".into(), json!(ctx.resolve(text)));
        }
        if let Some(reply_to) = self.reply_to.as_deref().filter(|r| !r.is_empty()) {
            body.insert("reply_to".into(), json!(ctx.resolve(reply_to)));
        }

        let timeout = config.http_timeout;
        let resp = ctx
            .services
            .http
            .post(format!("{}/emails", config.email_base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let status = resp.status();
        let reply: Value = resp.json().await.map_err(|e| transport_error(e, timeout))?;

        if !status.is_success() {
            return Err(NodeError::Api {
                service: "Resend",
                message: reply["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("request returned {status}")),
            });
        }

        Ok(json!({
            "success": true,
            "sentAt": Utc::now().to_rfc3339(),
            "actionType": tags::EMAIL,
            "data": {
                "emailId": reply["id"],
                "to": to,
                "from": from,
                "subject": subject,
            },
        }))
    }
}

/// Flatten `to` into a recipient list. Strings may be comma-separated;
/// array items are resolved one by one.
fn recipients(to: &Value, context: &Value) -> Vec<String> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_owned)
            .collect()
    };

    match to {
        Value::String(s) => split(s),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .flat_map(|item| split(&resolver::resolve_str(item, context)))
            .collect(),
        _ => Vec::new(),
    }
}
