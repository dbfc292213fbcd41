//! Wire envelope exchanged between services.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Action name carried by every reply envelope.
pub const REPLY_ACTION: &str = "reply";

/// Action name of the envelope wrapping a [`LoginEvent`].
pub const LOGIN_EVENT_ACTION: &str = "login-event";

/// Envelope for every message published on the services exchange.
///
/// Requests that expect an answer carry both `correlation_id` and `reply_to`;
/// the reply echoes the same `correlation_id`. An explicit error reply sets
/// `error` at the envelope level, which the caller settles as a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMessage {
    /// Remote operation name
    pub action: String,

    /// Action-specific payload
    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Set only on error replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ServiceMessage {
    /// Create a one-way message with an untyped payload.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
            correlation_id: None,
            reply_to: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a message from a typed payload.
    pub fn request<T: Serialize>(action: impl Into<String>, payload: &T) -> Result<Self, RpcError> {
        Ok(Self::new(action, serde_json::to_value(payload)?))
    }

    /// Build the reply envelope for a settled request.
    pub fn reply(correlation_id: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(REPLY_ACTION, data)
        }
    }

    /// Build an explicit error reply.
    pub fn error_reply(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::reply(correlation_id, Value::Null)
        }
    }

    /// Attach request/reply metadata.
    pub fn with_reply_to(mut self, correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Decode the payload into the type the action expects.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Serialize for the broker payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a broker payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Authentication attempt recorded by the audit service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub action: String,
    pub status: String,
    pub ip: String,
    pub user_agent: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LoginEvent {
    /// Wrap the event in its broker envelope.
    pub fn into_message(self) -> Result<ServiceMessage, RpcError> {
        ServiceMessage::request(LOGIN_EVENT_ACTION, &self)
    }
}

/// Inspect a reply payload for an application-level error.
///
/// A payload such as `{"error": "Unknown action", "action": "x"}` is a
/// successful protocol exchange; callers that want to branch on it use this.
pub fn payload_error(payload: &Value) -> Option<RpcError> {
    let message = payload.get("error")?.as_str()?;

    if message == crate::router::UNKNOWN_ACTION {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(RpcError::UnknownAction { action });
    }

    Some(RpcError::Remote {
        message: message.to_string(),
    })
}
