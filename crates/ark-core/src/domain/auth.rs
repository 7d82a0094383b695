//! Authenticated sessions and the stored credential artifact.
//!
//! The credential file (`<user>.arkpass`) is either JSON
//!
//! ```json
//! {"user_id": "doctor", "api_key": "...", "server_host": "...", "server_port": 9999}
//! ```
//!
//! or the legacy single line `user_id:api_key`.  Both parse into a
//! [`Credential`]; writing always produces the JSON form.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a credential artifact.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// Neither valid JSON nor the `user_id:api_key` form.
    #[error("credential file is not in a recognised format")]
    Malformed,

    /// The user id or API key is empty.
    #[error("credential file is missing the user id or API key")]
    MissingField,
}

/// Long-lived credential used to open sessions.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("api_key", &"<redacted>")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .finish()
    }
}

impl Credential {
    pub fn new(user_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            api_key: api_key.into(),
            server_host: None,
            server_port: None,
        }
    }

    /// Parses the contents of a credential file.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] when the text is neither form and
    /// [`CredentialError::MissingField`] when a required value is blank.
    pub fn parse(text: &str) -> Result<Self, CredentialError> {
        let text = text.trim();
        let cred = if text.starts_with('{') && text.ends_with('}') {
            serde_json::from_str::<Credential>(text).map_err(|_| CredentialError::Malformed)?
        } else {
            let (user, key) = text.split_once(':').ok_or(CredentialError::Malformed)?;
            Credential::new(user.trim(), key.trim())
        };

        if cred.user_id.trim().is_empty() || cred.api_key.trim().is_empty() {
            return Err(CredentialError::MissingField);
        }
        Ok(cred)
    }

    /// JSON text written to credential files.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// A server-issued session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub session_id: String,
    pub issued_at: SystemTime,
    valid: bool,
}

impl AuthSession {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            issued_at: SystemTime::now(),
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid && !self.session_id.is_empty()
    }

    /// Marks the session as expired after the server reported it.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_credential() {
        let text = r#"{"user_id": "doctor", "api_key": "k-123", "server_host": "10.0.0.2", "server_port": 9999}"#;

        let cred = Credential::parse(text).unwrap();

        assert_eq!(cred.user_id, "doctor");
        assert_eq!(cred.api_key, "k-123");
        assert_eq!(cred.server_host.as_deref(), Some("10.0.0.2"));
        assert_eq!(cred.server_port, Some(9999));
    }

    #[test]
    fn test_parse_legacy_credential() {
        let cred = Credential::parse("  doctor : k:with:colons \n").unwrap();

        assert_eq!(cred.user_id, "doctor");
        assert_eq!(cred.api_key, "k:with:colons");
        assert_eq!(cred.server_host, None);
    }

    #[test]
    fn test_parse_rejects_malformed_and_blank() {
        assert_eq!(Credential::parse("no separator"), Err(CredentialError::Malformed));
        assert_eq!(Credential::parse("{not json}"), Err(CredentialError::Malformed));
        assert_eq!(Credential::parse("doctor:"), Err(CredentialError::MissingField));
        assert_eq!(
            Credential::parse(r#"{"user_id": "", "api_key": "k"}"#),
            Err(CredentialError::MissingField)
        );
    }

    #[test]
    fn test_json_output_parses_back() {
        let mut cred = Credential::new("doctor", "secret");
        cred.server_port = Some(9999);

        assert_eq!(Credential::parse(&cred.to_json()).unwrap(), cred);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let cred = Credential::new("doctor", "secret");

        assert!(!format!("{cred:?}").contains("secret"));
    }

    #[test]
    fn test_session_invalidate() {
        let mut session = AuthSession::new("doctor", "s-1");
        assert!(session.is_valid());

        session.invalidate();

        assert!(!session.is_valid());
    }
}
