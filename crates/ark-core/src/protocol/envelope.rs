//! JSON envelopes carried inside encrypted frames.
//!
//! Requests are always `{endpoint, data, timestamp}` with a millisecond
//! timestamp.  Responses are loosely shaped: every response has a `status`,
//! error responses add `message` and `error_type`, and successful ones carry
//! their payload either under `data` or as extra top-level keys (`key`,
//! `session_id`, `user_info`, `tasks`).  [`ServerResponse`] keeps those extra
//! keys so each caller can pick the field its endpoint uses.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request sent to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub endpoint: String,
    pub data: Value,
    /// Unix time in milliseconds.
    pub timestamp: i64,
}

impl RequestEnvelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(endpoint: impl Into<String>, data: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self {
            endpoint: endpoint.into(),
            data,
            timestamp,
        }
    }
}

/// Coarse outcome of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
    /// `status` missing or not one of the two known values.
    Unknown,
}

/// Server-side error classification from `error_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The session id is no longer valid; one re-login may recover it.
    SessionExpired,
    /// The user id in the credential does not exist.
    UserNotFound,
    /// The API key in the credential was rejected.
    InvalidApiKey,
    /// The account is banned.
    Banned,
    /// Any other server-reported error type.
    Other(String),
}

impl ErrorKind {
    fn from_wire(value: &str) -> Self {
        match value {
            "session_expired" | "invalid_session" => Self::SessionExpired,
            "user_not_found" => Self::UserNotFound,
            "invalid_api_key" => Self::InvalidApiKey,
            "banned" | "user_banned" => Self::Banned,
            other => Self::Other(other.to_string()),
        }
    }

    /// Credential errors that make a stored credential worthless.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Self::UserNotFound | Self::InvalidApiKey)
    }
}

/// Response decoded from the remote service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Endpoint-specific top-level fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerResponse {
    /// Parses a response object; anything that is not a JSON object fails.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn success(data: Value) -> Self {
        Self {
            status: "success".into(),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn error(error_type: &str, message: &str) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
            error_type: Some(error_type.into()),
            ..Self::default()
        }
    }

    pub fn status(&self) -> ResponseStatus {
        match self.status.as_str() {
            "success" => ResponseStatus::Success,
            "error" => ResponseStatus::Error,
            _ => ResponseStatus::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == ResponseStatus::Success
    }

    /// Classified `error_type`, if the response carries one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_type.as_deref().map(ErrorKind::from_wire)
    }

    /// Human-readable reason for a failed response.
    pub fn reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error_type.clone())
            .unwrap_or_else(|| format!("server returned status {:?}", self.status))
    }

    /// Looks a field up in `data` first, then among the top-level extras.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data
            .as_ref()
            .and_then(|d| d.get(name))
            .or_else(|| self.extra.get(name))
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_serializes_expected_keys() {
        // Arrange
        let env = RequestEnvelope::new("login", json!({"user_id": "doctor"}));

        // Act
        let value = serde_json::to_value(&env).unwrap();

        // Assert
        assert_eq!(value["endpoint"], "login");
        assert_eq!(value["data"]["user_id"], "doctor");
        assert!(value["timestamp"].as_i64().unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_login_response_exposes_top_level_session_id() {
        let resp =
            ServerResponse::from_value(json!({"status": "success", "session_id": "s-1"})).unwrap();

        assert!(resp.is_success());
        assert_eq!(resp.str_field("session_id"), Some("s-1"));
    }

    #[test]
    fn test_field_prefers_data_over_top_level() {
        let resp = ServerResponse::from_value(json!({
            "status": "success",
            "data": {"version": "2.0.0"},
            "version": "ignored"
        }))
        .unwrap();

        assert_eq!(resp.str_field("version"), Some("2.0.0"));
    }

    #[test]
    fn test_error_kind_classification() {
        let expired = ServerResponse::error("session_expired", "会话已过期");
        let rejected = ServerResponse::error("invalid_api_key", "bad key");
        let other = ServerResponse::error("rate_limited", "slow down");

        assert_eq!(expired.error_kind(), Some(ErrorKind::SessionExpired));
        assert!(rejected.error_kind().unwrap().invalidates_credential());
        assert_eq!(
            other.error_kind(),
            Some(ErrorKind::Other("rate_limited".into()))
        );
        assert_eq!(expired.reason(), "会话已过期");
    }

    #[test]
    fn test_missing_status_is_unknown() {
        let resp = ServerResponse::from_value(json!({"data": {}})).unwrap();

        assert_eq!(resp.status(), ResponseStatus::Unknown);
        assert!(!resp.is_success());
    }

    #[test]
    fn test_non_object_response_is_rejected() {
        assert!(ServerResponse::from_value(json!([1, 2, 3])).is_err());
    }
}
