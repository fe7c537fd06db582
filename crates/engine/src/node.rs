//! Closed node model.
//!
//! [`NodeData`] is whatever the editor saved; [`Node`] is what the engine
//! executes. Conversion happens once, when the graph is built, so a bad
//! node fails the run before anything has an external effect.

use nodes::mail::MailFilter;
use nodes::ActionNode;
use serde_json::Value;

use crate::models::NodeData;
use crate::EngineError;

/// Wire `type` tags of the node variants.
pub mod types {
    pub const MANUAL_TRIGGER: &str = "manualTrigger";
    pub const WEBHOOK_TRIGGER: &str = "webhookTrigger";
    pub const SCHEDULE_TRIGGER: &str = "scheduleTrigger";
    pub const EMAIL_TRIGGER: &str = "emailTrigger";
    pub const ACTION: &str = "action";
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    ManualTrigger,
    WebhookTrigger,
    /// `cron` is `None` when the editor saved the node without an expression.
    ScheduleTrigger { cron: Option<String> },
    EmailTrigger { filter: MailFilter },
    Action(ActionNode),
}

impl NodeKind {
    pub fn is_trigger(&self) -> bool {
        !matches!(self, Self::Action(_))
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

impl TryFrom<&NodeData> for Node {
    type Error = EngineError;

    fn try_from(data: &NodeData) -> Result<Self, Self::Error> {
        let kind = match data.node_type.as_str() {
            types::MANUAL_TRIGGER => NodeKind::ManualTrigger,
            types::WEBHOOK_TRIGGER => NodeKind::WebhookTrigger,
            types::SCHEDULE_TRIGGER => NodeKind::ScheduleTrigger {
                cron: data
                    .data
                    .get("cronExpression")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned),
            },
            types::EMAIL_TRIGGER => NodeKind::EmailTrigger {
                filter: email_filter(&data.data),
            },
            types::ACTION => {
                NodeKind::Action(ActionNode::from_data(&data.data).map_err(|source| {
                    EngineError::InvalidNode {
                        node_id: data.id.clone(),
                        source,
                    }
                })?)
            }
            other => {
                return Err(EngineError::UnknownNodeType {
                    node_id: data.id.clone(),
                    node_type: other.to_owned(),
                })
            }
        };

        Ok(Self {
            id: data.id.clone(),
            kind,
        })
    }
}

/// Filters are optional; a missing or malformed `data` bag means "match all".
pub(crate) fn email_filter(data: &Value) -> MailFilter {
    if data.is_object() {
        serde_json::from_value(data.clone()).unwrap_or_default()
    } else {
        MailFilter::default()
    }
}
