//! Error types for the messaging layer.
//!
//! | Error | Retryable | Raised by |
//! |-------|-----------|-----------|
//! | `RpcError::TransportUnavailable` | Yes | publish returned `false` |
//! | `RpcError::Timeout` | Yes | no reply before the deadline |
//! | `RpcError::CircuitOpen` | Yes | breaker rejecting fast |
//! | `RpcError::Remote` | No | remote replied with an explicit error |
//! | `RpcError::UnknownAction` | No | remote has no handler for the action |
//! | `RpcError::Decode` | No | malformed payload |
//!
//! Transport loss inside the connection manager is never surfaced as an
//! `RpcError`; it is absorbed by the reconnect loop and shows up to callers
//! only as a failed publish.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to code that issues or serves RPC calls.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No channel was available, or the broker refused the publish.
    #[error("Failed to publish message to {routing_key}")]
    TransportUnavailable { routing_key: String },

    /// No reply arrived within the request deadline.
    #[error("Request to {target} timed out after {}ms", .elapsed.as_millis())]
    Timeout { target: String, elapsed: Duration },

    /// The breaker for the downstream service is open.
    #[error("Circuit for {service} is open - request rejected (retry in {}ms)", .retry_in.as_millis())]
    CircuitOpen { service: String, retry_in: Duration },

    /// The remote handler replied with an explicit error.
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// The remote service has no handler for the action.
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    /// Payload could not be encoded or decoded.
    #[error("Message decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RpcError {
    /// Whether the caller may reasonably retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::TransportUnavailable { .. }
                | RpcError::Timeout { .. }
                | RpcError::CircuitOpen { .. }
        )
    }
}

/// Errors from the broker connection itself.
#[derive(Error, Debug)]
pub enum BusError {
    /// A connection attempt is in flight or the channel is gone.
    #[error("Broker connection not available")]
    TransportUnavailable,

    /// The broker did not complete the handshake in time.
    #[error("Broker connection timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Outcome of a consumer handler that did not succeed.
///
/// Transient failures are negatively acknowledged with requeue; permanent
/// ones (validation errors, poison messages) are dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Temporary failure: {0}")]
    Transient(String),

    #[error("Validation Error: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the delivery should go back on the queue.
    pub fn requeue(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        if err.is_retryable() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}
