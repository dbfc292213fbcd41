//! HTTP request handlers for the service bus.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::RpcError;
use crate::messaging::{
    BreakerRegistry, ConnectionManager, CorrelationRegistry, MessagingStatus, Publisher,
    ReplyDispatcher, RetryQueue,
};
use crate::types::{payload_error, LoginEvent, MessagingConfig};

/// Application state shared across handlers.
pub struct AppState {
    pub config: MessagingConfig,
    pub connection: Arc<ConnectionManager>,
    pub registry: Arc<CorrelationRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub retry_queue: Arc<RetryQueue>,
}

impl AppState {
    /// Build the process-wide registry, breakers and retry queue.
    pub fn new(config: MessagingConfig, connection: Arc<ConnectionManager>, publisher: Arc<dyn Publisher>) -> Self {
        let reply_to = config.responses_queue();

        let registry = Arc::new(CorrelationRegistry::new(
            Arc::clone(&publisher),
            reply_to.as_str(),
            config.request_timeout,
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            &config.downstream_services,
            config.breaker,
            Arc::clone(&publisher),
            &reply_to,
        ));
        let retry_queue = Arc::new(RetryQueue::new(publisher, config.retry));

        Self {
            config,
            connection,
            registry,
            breakers,
            retry_queue,
        }
    }

    /// Routes replies from this process's mailbox.
    pub fn dispatcher(&self) -> ReplyDispatcher {
        ReplyDispatcher::new(Arc::clone(&self.registry), Arc::clone(&self.breakers))
    }

    pub fn status(&self) -> MessagingStatus {
        MessagingStatus::collect(
            self.config.service_name(),
            self.connection.is_connected(),
            &self.registry,
            &self.breakers,
            &self.retry_queue,
        )
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self {
            RpcError::CircuitOpen { .. } | RpcError::TransportUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RpcError::Remote { .. } | RpcError::Decode(_) => StatusCode::BAD_GATEWAY,
            RpcError::UnknownAction { .. } => StatusCode::NOT_FOUND,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.service_name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Connection, breaker and retry queue state.
pub async fn messaging_status(State(state): State<Arc<AppState>>) -> Json<MessagingStatus> {
    Json(state.status())
}

/// Relay a request to another service and return its reply.
///
/// Services with a configured breaker are called through it; others go
/// through the plain correlation registry.
pub async fn rpc_relay(
    State(state): State<Arc<AppState>>,
    Path((service, action)): Path<(String, String)>,
    Json(data): Json<Value>,
) -> Result<Response, RpcError> {
    info!(service = %service, action = %action, "Relaying request");

    let reply = match state.breakers.get(&service) {
        Some(breaker) => breaker.call(&action, data).await?,
        None => state.registry.send(&service, &action, data, None).await?,
    };

    // The exchange succeeded but the remote refused the request.
    if let Some(denied) = payload_error(&reply) {
        warn!(service = %service, action = %action, error = %denied, "Request denied by remote service");
        let status = match denied {
            RpcError::UnknownAction { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        return Ok((status, Json(reply)).into_response());
    }

    Ok(Json(reply).into_response())
}

/// Login event intake response.
#[derive(Debug, Serialize)]
pub struct LoginEventAccepted {
    accepted: bool,
    /// Publish failed and the event waits in the retry queue
    queued: bool,
}

/// Accept a login event for the audit service.
///
/// Publishing is fire-and-forget; a failed publish lands in the retry queue.
pub async fn login_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<LoginEvent>,
) -> Result<(StatusCode, Json<LoginEventAccepted>), RpcError> {
    let message = event.into_message()?;
    let published = state
        .retry_queue
        .publish_or_enqueue(state.config.login_routing_key(), message)
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(LoginEventAccepted {
            accepted: true,
            queued: !published,
        }),
    ))
}
