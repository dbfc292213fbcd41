//! Action router for a service's request queue.
//!
//! Maps the `action` string of an inbound envelope to its handler. Every
//! request that names a reply queue gets an answer: the handler's result,
//! `{ error: "Unknown action", action }` when nothing is registered,
//! `{ error: "Invalid payload", message }` when the payload does not match
//! the handler's type, or `{ error: "Internal processing error", message }`
//! when the handler fails.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::messaging::{MessagingStatus, ReplySink};
use crate::types::ServiceMessage;

/// Error text of the reply to an action nobody handles.
pub const UNKNOWN_ACTION: &str = "Unknown action";

/// Error text of the reply to a payload that fails to decode.
pub const INVALID_PAYLOAD: &str = "Invalid payload";

/// Error text of the reply to a handler failure.
pub const INTERNAL_ERROR: &str = "Internal processing error";

/// Liveness probe answered by every service.
pub const PING_ACTION: &str = "ping";

/// Messaging introspection answered by every service.
pub const STATUS_ACTION: &str = "get-messaging-status";

enum Failure {
    InvalidPayload(String),
    Handler(HandlerError),
}

type Handler = Arc<dyn Fn(ServiceMessage) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

/// Dispatches requests to handlers by action name.
pub struct ActionRouter {
    service: String,
    handlers: HashMap<String, Handler>,
}

impl ActionRouter {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register a handler that decodes its payload into `Req` and answers
    /// with a serializable `Resp`.
    pub fn route<Req, Resp, F, Fut>(self, action: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        self.insert(
            action,
            Arc::new(move |message: ServiceMessage| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: Req = serde_json::from_value(message.data)
                        .map_err(|e| Failure::InvalidPayload(e.to_string()))?;
                    let response = handler(request).await.map_err(Failure::Handler)?;
                    serde_json::to_value(response)
                        .map_err(|e| Failure::Handler(HandlerError::Permanent(e.to_string())))
                }
                .boxed()
            }),
        )
    }

    /// Register a handler that works on the whole envelope.
    pub fn route_raw<F, Fut>(self, action: &str, handler: F) -> Self
    where
        F: Fn(ServiceMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        self.insert(
            action,
            Arc::new(move |message: ServiceMessage| {
                let handler = Arc::clone(&handler);
                async move { handler(message).await.map_err(Failure::Handler) }.boxed()
            }),
        )
    }

    /// Register `ping` and `get-messaging-status`.
    pub fn with_builtins<S>(self, status: S) -> Self
    where
        S: Fn() -> MessagingStatus + Send + Sync + 'static,
    {
        let service = self.service.clone();
        let status = Arc::new(status);

        self.route_raw(PING_ACTION, move |_| {
            let reply = json!({ "pong": true, "service": service.clone() });
            async move { Ok(reply) }
        })
        .route_raw(STATUS_ACTION, move |_| {
            let status = status();
            async move { serde_json::to_value(status).map_err(|e| HandlerError::Permanent(e.to_string())) }
        })
    }

    fn insert(mut self, action: &str, handler: Handler) -> Self {
        if self.handlers.insert(action.to_string(), handler).is_some() {
            warn!(action = %action, "Replacing existing handler");
        }
        self
    }

    /// Service name this router answers for.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether a handler is registered for `action`.
    pub fn handles(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered actions, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        actions.sort_unstable();
        actions
    }

    /// Run the handler for `message` and answer through `reply` if present.
    ///
    /// Once a reply went out the delivery is settled successfully; without a
    /// reply sink the failure is returned so the bus can requeue or drop it.
    pub async fn dispatch(&self, message: ServiceMessage, reply: Option<ReplySink>) -> Result<(), HandlerError> {
        let action = message.action.clone();
        info!(service = %self.service, action = %action, "Received service request");

        let Some(handler) = self.handlers.get(&action).cloned() else {
            warn!(service = %self.service, action = %action, "No handler for action");
            return match reply {
                Some(reply) => {
                    reply.send(json!({ "error": UNKNOWN_ACTION, "action": action })).await;
                    Ok(())
                }
                None => Err(HandlerError::Permanent(format!("{UNKNOWN_ACTION}: {action}"))),
            };
        };

        match (handler(message).await, reply) {
            (Ok(data), Some(reply)) => {
                reply.send(data).await;
                Ok(())
            }
            (Ok(_), None) => {
                debug!(action = %action, "Handled request without reply queue");
                Ok(())
            }
            (Err(Failure::InvalidPayload(message)), Some(reply)) => {
                warn!(action = %action, error = %message, "Rejected request payload");
                reply.send(json!({ "error": INVALID_PAYLOAD, "message": message })).await;
                Ok(())
            }
            (Err(Failure::InvalidPayload(message)), None) => {
                Err(HandlerError::Permanent(format!("{INVALID_PAYLOAD}: {message}")))
            }
            (Err(Failure::Handler(e)), Some(reply)) => {
                warn!(action = %action, error = %e, "Error processing request");
                reply.send(json!({ "error": INTERNAL_ERROR, "message": e.to_string() })).await;
                Ok(())
            }
            (Err(Failure::Handler(e)), None) => Err(e),
        }
    }
}
