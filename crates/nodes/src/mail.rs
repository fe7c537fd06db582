//! Normalized inbox messages, sender/subject filters, and the seam through
//! which inbox-read actions wait for mail.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::InboxReadParams;
use crate::{Credential, NodeError};

/// A parsed email in the shape workflows see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub html: String,
    pub date: DateTime<Utc>,
}

/// Parse a raw RFC 5322 message.
///
/// Returns `None` when the bytes are not a parseable message.
pub fn parse_message(raw: &[u8]) -> Option<InboxMessage> {
    use mail_parser::MessageParser;

    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|a| a.first())
        .map(|a| {
            let address = a.address().unwrap_or_default();
            match a.name() {
                Some(name) if !name.is_empty() => format!("{name} <{address}>"),
                _ => address.to_owned(),
            }
        })
        .unwrap_or_default();

    let to = parsed
        .to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .unwrap_or_default()
        .to_owned();

    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboxMessage {
        from,
        to,
        subject: parsed.subject().unwrap_or_default().to_owned(),
        body: parsed
            .body_text(0)
            .map(|s| s.into_owned())
            .unwrap_or_default(),
        html: parsed
            .body_html(0)
            .map(|s| s.into_owned())
            .unwrap_or_default(),
        date,
    })
}

/// Sender/subject filter. Both conditions are optional and ANDed; an empty
/// filter matches every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFilter {
    #[serde(default, rename = "senderFilter")]
    pub sender_contains: Option<String>,
    #[serde(default, rename = "subjectFilter")]
    pub subject_contains: Option<String>,
}

impl MailFilter {
    pub fn matches(&self, message: &InboxMessage) -> bool {
        let sender_ok = match non_empty(&self.sender_contains) {
            Some(needle) => message.from.contains(needle),
            None => true,
        };
        let subject_ok = match non_empty(&self.subject_contains) {
            Some(needle) => message.subject.contains(needle),
            None => true,
        };
        sender_ok && subject_ok
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl From<&InboxReadParams> for MailFilter {
    fn from(params: &InboxReadParams) -> Self {
        Self {
            sender_contains: params.sender_filter.clone(),
            subject_contains: params.subject_filter.clone(),
        }
    }
}

/// Identity and bearer token for an OAuth-authorized mailbox.
#[derive(Clone, PartialEq, Eq)]
pub struct MailboxAccount {
    pub email: String,
    pub access_token: String,
}

impl std::fmt::Debug for MailboxAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxAccount")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl MailboxAccount {
    /// Build from a mailbox credential: `access_token` plus either `email` or
    /// an `id_token` whose payload carries an `email` claim.
    pub fn from_credential(credential: &Credential) -> Result<Self, NodeError> {
        let access_token = credential.require("access_token")?.to_owned();

        let email = match credential.field("email") {
            Some(email) => email.to_owned(),
            None => email_from_id_token(credential.require("id_token")?).ok_or_else(|| {
                NodeError::Mailbox("id_token carries no email claim".into())
            })?,
        };

        Ok(Self {
            email,
            access_token,
        })
    }
}

fn email_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("email")?.as_str().map(str::to_owned)
}

/// What an inbox-read action asks the mailbox watcher for.
#[derive(Debug, Clone)]
pub struct InboxWaitRequest {
    pub user_id: Uuid,
    pub execution_id: Uuid,
    pub account: MailboxAccount,
    pub filter: MailFilter,
}

/// Something that can hand an execution the next matching inbox message.
///
/// Implemented by the inbox monitor; the action applies its own deadline, so
/// implementations may wait indefinitely.
#[async_trait]
pub trait InboxWatch: Send + Sync {
    async fn wait_for_message(&self, request: InboxWaitRequest) -> Result<InboxMessage, NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(from: &str, subject: &str) -> InboxMessage {
        InboxMessage {
            from: from.into(),
            to: String::new(),
            subject: subject.into(),
            body: "body".into(),
            html: String::new(),
            date: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(MailFilter::default().matches(&message("a@b.c", "anything")));
    }

    #[test]
    fn conditions_are_anded() {
        let filter = MailFilter {
            sender_contains: Some("billing@".into()),
            subject_contains: Some("Invoice".into()),
        };
        assert!(filter.matches(&message("billing@acme.io", "Invoice #4")));
        assert!(!filter.matches(&message("billing@acme.io", "Newsletter")));
        assert!(!filter.matches(&message("news@acme.io", "Invoice #4")));
    }

    #[test]
    fn parses_a_raw_message() {
        let raw = b"From: Ada <ada@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Report ready\r\n\
Date: Sat, 17 Oct 2026 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
The numbers are in.\r\n";

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.from, "Ada <ada@example.com>");
        assert_eq!(parsed.to, "bob@example.com");
        assert_eq!(parsed.subject, "Report ready");
        assert!(parsed.body.contains("The numbers are in."));
        assert_eq!(parsed.date.to_rfc3339(), "2026-10-17T10:00:00+00:00");
    }

    #[test]
    fn account_email_falls_back_to_id_token_claim() {
        let claims = URL_SAFE_NO_PAD.encode(br#"{"email":"me@example.com"}"#);
        let credential = Credential::new(
            "gmail",
            json!({ "access_token": "ya29", "id_token": format!("h.{claims}.s") }),
        );

        let account = MailboxAccount::from_credential(&credential).unwrap();
        assert_eq!(account.email, "me@example.com");
        assert_eq!(account.access_token, "ya29");
    }

    #[test]
    fn account_requires_an_access_token() {
        let credential = Credential::new("gmail", json!({ "email": "me@example.com" }));
        assert!(matches!(
            MailboxAccount::from_credential(&credential),
            Err(NodeError::MissingCredentialField { field: "access_token", .. })
        ));
    }
}
