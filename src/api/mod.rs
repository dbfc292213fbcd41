//! HTTP API.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::types::ServiceRole;
use handlers::AppState;

/// Build the HTTP routes for this process's role.
///
/// Login event intake is only served by the auth service.
pub fn routes(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Messaging
        .route("/messaging/status", get(handlers::messaging_status))
        .route("/rpc/:service/:action", post(handlers::rpc_relay));

    if state.config.role == ServiceRole::Auth {
        router = router.route("/events/login", post(handlers::login_event));
    }

    router.with_state(state)
}
