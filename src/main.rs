//! Service Bus - Main Entry Point
//!
//! Runs one service role (auth, tenant or audit) on the shared exchange.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use service_bus::api::{self, handlers::AppState};
use service_bus::messaging::{ConnectionManager, ConnectionSettings, MessageBus, Publisher};
use service_bus::router::ActionRouter;
use service_bus::types::{MessagingConfig, ServiceRole};
use service_bus::workers::{AuditLogWorker, TracingAuditSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = MessagingConfig::from_env();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "service_bus=info,tower_http=debug".into()),
    );
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Service Bus v{}", env!("CARGO_PKG_VERSION"));
    info!(
        service = %config.role,
        downstream = ?config.downstream_services,
        "Messaging configuration loaded"
    );

    // Broker connection
    let connection = ConnectionManager::new(ConnectionSettings::from(&config));
    if let Err(e) = connection.connect().await {
        warn!(error = %e, "RabbitMQ not reachable yet, continuing with reconnect in background");
    }

    let bus = MessageBus::new(Arc::clone(&connection));
    let publisher: Arc<dyn Publisher> = bus.clone();
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&connection), publisher));

    // Replies to our own requests
    let dispatcher = state.dispatcher();
    bus.consume_replies(&config.responses_queue(), move |reply| {
        dispatcher.dispatch(reply);
    });

    let retry_processor = state.retry_queue.start(config.retry.interval);

    // Requests addressed to this service
    let status_state = Arc::clone(&state);
    let router = Arc::new(
        ActionRouter::new(config.service_name()).with_builtins(move || status_state.status()),
    );
    info!(actions = ?router.actions(), "Registered request handlers");

    bus.consume_request_reply(&config.requests_queue(), move |request, reply| {
        let router = Arc::clone(&router);
        async move { router.dispatch(request, reply).await }
    });

    if config.role == ServiceRole::Audit {
        let worker = Arc::new(AuditLogWorker::new(Arc::new(TracingAuditSink)));
        worker.start(&bus, config.login_events_queue(), config.login_routing_key());
    }

    // Build HTTP routes
    let app = api::routes(Arc::clone(&state))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down messaging");
    retry_processor.abort();
    connection.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
