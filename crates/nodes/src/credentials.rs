//! Execution-scoped credential map.
//!
//! Loaded once per execution from the credential store and handed to the
//! dispatcher by reference. Keys are application names, matched
//! case-insensitively.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::NodeError;

/// One stored credential: an application name and its opaque payload.
#[derive(Clone)]
pub struct Credential {
    pub application: String,
    pub data: Value,
}

// Payloads hold secrets; keep them out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("application", &self.application)
            .field("data", &"<redacted>")
            .finish()
    }
}

impl Credential {
    pub fn new(application: impl Into<String>, data: Value) -> Self {
        Self {
            application: application.into(),
            data,
        }
    }

    /// A non-empty string field of the payload.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Like [`Credential::field`] but missing fields are an error.
    pub fn require(&self, key: &'static str) -> Result<&str, NodeError> {
        self.field(key).ok_or_else(|| NodeError::MissingCredentialField {
            application: self.application.clone(),
            field: key,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialMap {
    by_application: HashMap<String, Credential>,
}

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential. A later insert for the same application wins.
    pub fn insert(&mut self, credential: Credential) {
        self.by_application
            .insert(credential.application.to_lowercase(), credential);
    }

    pub fn get(&self, application: &str) -> Option<&Credential> {
        self.by_application.get(&application.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.by_application.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_application.is_empty()
    }
}

impl FromIterator<Credential> for CredentialMap {
    fn from_iter<I: IntoIterator<Item = Credential>>(iter: I) -> Self {
        let mut map = Self::new();
        for credential in iter {
            map.insert(credential);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_ignores_case() {
        let map: CredentialMap = [Credential::new("Telegram", json!({ "accessToken": "t" }))]
            .into_iter()
            .collect();

        assert_eq!(map.get("telegram").unwrap().field("accessToken"), Some("t"));
        assert!(map.get("resend").is_none());
    }

    #[test]
    fn require_reports_the_missing_field() {
        let cred = Credential::new("resend", json!({ "apiKey": "" }));
        let err = cred.require("apiKey").unwrap_err();
        assert_eq!(err.to_string(), "'resend' credential has no 'apiKey'");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cred = Credential::new("openai", json!({ "apiKey": "sk-secret" }));
        assert!(!format!("{cred:?}").contains("sk-secret"));
    }
}
