//! The closed set of action types and their typed parameters.
//!
//! Workflow definitions carry actions as `{ actionType, parameters, credentials }`
//! with a free-form parameter bag. [`ActionNode::from_data`] turns that bag into
//! a typed [`Action`] once, when the graph is built, so the dispatcher never
//! sees an unknown tag or a missing field.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::NodeError;

/// Wire tags for `data.actionType`.
pub mod tags {
    pub const HTTP: &str = "WebHookNodeType";
    pub const CHAT: &str = "TelegramNodeType";
    pub const EMAIL: &str = "ResendNodeType";
    pub const INBOX_READ: &str = "GmailTrigger";
    pub const OPENAI: &str = "openAiNodeType";
    pub const OPENROUTER: &str = "openRouterNodeType";
}

/// An action node's validated payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionNode {
    pub action: Action,
    /// Application name of the credential to use, when the node names one.
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Http(HttpParams),
    Chat(ChatParams),
    Email(EmailParams),
    InboxRead(InboxReadParams),
    Llm(LlmParams),
}

impl Action {
    /// Wire tag of this action.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Http(_) => tags::HTTP,
            Self::Chat(_) => tags::CHAT,
            Self::Email(_) => tags::EMAIL,
            Self::InboxRead(_) => tags::INBOX_READ,
            Self::Llm(p) => match p.provider {
                ProviderKind::OpenAi => tags::OPENAI,
                ProviderKind::OpenRouter => tags::OPENROUTER,
            },
        }
    }

    /// Credential application used when the node does not name one.
    pub fn default_credential(&self) -> Option<&'static str> {
        match self {
            Self::Http(_) => None,
            Self::Chat(_) => Some("telegram"),
            Self::Email(_) => Some("resend"),
            Self::InboxRead(_) => Some("gmail"),
            Self::Llm(p) => Some(match p.provider {
                ProviderKind::OpenAi => "openai",
                ProviderKind::OpenRouter => "openrouter",
            }),
        }
    }

    /// Build a typed action from its tag and parameter bag.
    ///
    /// # Errors
    /// - [`NodeError::UnsupportedAction`] for an unknown tag.
    /// - [`NodeError::InvalidParameters`] when the bag doesn't fit the tag's struct.
    pub fn parse(tag: &str, parameters: Map<String, Value>) -> Result<Self, NodeError> {
        let params = Value::Object(parameters);
        match tag {
            tags::HTTP => typed(tags::HTTP, params).map(Self::Http),
            tags::CHAT => typed(tags::CHAT, params).map(Self::Chat),
            tags::EMAIL => typed(tags::EMAIL, params).map(Self::Email),
            tags::INBOX_READ => typed(tags::INBOX_READ, params).map(Self::InboxRead),
            tags::OPENAI => typed::<LlmParams>(tags::OPENAI, params).map(|mut p| {
                p.provider = ProviderKind::OpenAi;
                Self::Llm(p)
            }),
            tags::OPENROUTER => typed::<LlmParams>(tags::OPENROUTER, params).map(|mut p| {
                p.provider = ProviderKind::OpenRouter;
                Self::Llm(p)
            }),
            other => Err(NodeError::UnsupportedAction(other.to_owned())),
        }
    }
}

fn typed<T: for<'de> Deserialize<'de>>(action: &'static str, params: Value) -> Result<T, NodeError> {
    serde_json::from_value(params).map_err(|e| NodeError::InvalidParameters {
        action,
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActionData {
    action_type: Option<String>,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
    #[serde(default)]
    credentials: Option<Value>,
}

impl ActionNode {
    /// Parse the `data` object of an `action` node.
    pub fn from_data(data: &Value) -> Result<Self, NodeError> {
        let raw: RawActionData =
            serde_json::from_value(data.clone()).map_err(|e| NodeError::InvalidParameters {
                action: "action",
                message: e.to_string(),
            })?;

        let tag = raw
            .action_type
            .filter(|t| !t.is_empty())
            .ok_or(NodeError::MissingParameter("actionType"))?;

        let action = Action::parse(&tag, raw.parameters.unwrap_or_default())?;
        let credential = raw.credentials.as_ref().and_then(credential_reference);

        Ok(Self { action, credential })
    }
}

/// `credentials` may be `"telegram"` or `{ "application": "telegram", … }`.
fn credential_reference(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("application")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

/// Generic outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpParams {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    /// JSON text (or an object) of extra request headers.
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Chat-bot message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParams {
    /// Numeric id or `@username`; numbers are accepted as-is.
    pub chat_id: Value,
    pub message: String,
    #[serde(default)]
    pub parse_mode: Option<String>,
}

/// Transactional email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailParams {
    pub from: String,
    /// A single address, a comma-separated list, or an array.
    pub to: Value,
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Wait for the next inbox message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxReadParams {
    #[serde(default)]
    pub sender_filter: Option<String>,
    #[serde(default)]
    pub subject_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    OpenRouter,
}

impl ProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-5-mini",
            Self::OpenRouter => "openai/gpt-5-mini",
        }
    }
}

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// LLM completion, shared by both provider variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmParams {
    #[serde(skip)]
    pub provider: ProviderKind,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub max_tokens: Option<f64>,
}

impl LlmParams {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.provider.default_model().to_owned())
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn max_tokens(&self) -> u32 {
        match self.max_tokens {
            // Fractions drop; anything past the u32 range clamps to its max.
            Some(n) if n >= 1.0 => n.min(f64::from(u32::MAX)).trunc() as u32,
            _ => DEFAULT_MAX_TOKENS,
        }
    }
}

/// Form editors send numbers as strings; accept both, and treat `""` as unset.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got '{s}'"))),
        Some(other) => Err(de::Error::custom(format!("expected a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_chat_action_with_credential_reference() {
        let node = ActionNode::from_data(&json!({
            "actionType": "TelegramNodeType",
            "parameters": { "chatId": "123", "message": "{{previousNode.content}}" },
            "credentials": { "application": "Telegram", "id": "c1" }
        }))
        .unwrap();

        assert_eq!(node.credential.as_deref(), Some("Telegram"));
        assert!(matches!(node.action, Action::Chat(ChatParams { ref message, .. }) if message == "{{previousNode.content}}"));
    }

    #[test]
    fn unknown_action_type_is_unsupported() {
        let err = ActionNode::from_data(&json!({ "actionType": "FaxNodeType" })).unwrap_err();
        assert!(matches!(err, NodeError::UnsupportedAction(tag) if tag == "FaxNodeType"));
    }

    #[test]
    fn missing_required_parameter_is_a_validation_error() {
        let err = ActionNode::from_data(&json!({
            "actionType": "ResendNodeType",
            "parameters": { "from": "a@b.c", "to": "d@e.f", "subject": "hi" }
        }))
        .unwrap_err();

        assert!(err.is_validation());
        assert!(err.to_string().contains("html"));
    }

    #[test]
    fn inbox_read_needs_no_parameters() {
        let node = ActionNode::from_data(&json!({ "actionType": "GmailTrigger" })).unwrap();
        assert_eq!(node.action, Action::InboxRead(InboxReadParams::default()));
        assert_eq!(node.action.default_credential(), Some("gmail"));
    }

    #[test]
    fn llm_variants_keep_their_provider_and_defaults() {
        let node = ActionNode::from_data(&json!({
            "actionType": "openRouterNodeType",
            "parameters": { "prompt": "hi", "temperature": "0.2", "maxTokens": "" }
        }))
        .unwrap();

        let Action::Llm(params) = &node.action else {
            panic!("expected llm action");
        };
        assert_eq!(params.provider, ProviderKind::OpenRouter);
        assert_eq!(params.model(), "openai/gpt-5-mini");
        assert_eq!(params.temperature(), 0.2);
        assert_eq!(params.max_tokens(), DEFAULT_MAX_TOKENS);
        assert_eq!(node.action.tag(), "openRouterNodeType");
    }

    #[test]
    fn max_tokens_clamps_instead_of_wrapping() {
        let params = |max_tokens: f64| LlmParams {
            provider: ProviderKind::OpenAi,
            prompt: "hi".into(),
            model: None,
            temperature: None,
            max_tokens: Some(max_tokens),
        };
        assert_eq!(params(512.9).max_tokens(), 512);
        assert_eq!(params(1e12).max_tokens(), u32::MAX);
        assert_eq!(params(0.5).max_tokens(), DEFAULT_MAX_TOKENS);
        assert_eq!(params(f64::NAN).max_tokens(), DEFAULT_MAX_TOKENS);
    }
}
