//! Audit log worker for login events.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::messaging::MessageBus;
use crate::types::{LoginEvent, ServiceMessage, LOGIN_EVENT_ACTION};

/// Destination for audit records.
///
/// Return [`HandlerError::Transient`] when the store is temporarily
/// unreachable so the event is redelivered.
#[async_trait]
pub trait AuditLogSink: Send + Sync {
    async fn record(&self, event: &LoginEvent) -> Result<(), HandlerError>;
}

/// Sink that writes each event as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditLogSink for TracingAuditSink {
    async fn record(&self, event: &LoginEvent) -> Result<(), HandlerError> {
        info!(
            target: "audit",
            email = %event.email,
            user_id = ?event.user_id,
            tenant_id = ?event.tenant_id,
            action = %event.action,
            status = %event.status,
            ip = %event.ip,
            user_agent = %event.user_agent,
            timestamp = %event.timestamp,
            "Login event"
        );
        Ok(())
    }
}

/// Consumes `login_events` and records each event.
pub struct AuditLogWorker {
    sink: Arc<dyn AuditLogSink>,
}

impl AuditLogWorker {
    pub fn new(sink: Arc<dyn AuditLogSink>) -> Self {
        Self { sink }
    }

    /// Handle one delivery from the login events queue.
    pub async fn process(&self, message: ServiceMessage) -> Result<(), HandlerError> {
        if message.action != LOGIN_EVENT_ACTION {
            warn!(action = %message.action, "Unexpected action on login events queue");
        }

        let event: LoginEvent = message.data_as()?;

        info!(
            action = %event.action,
            status = %event.status,
            email = %event.email,
            "Processing login event"
        );

        self.sink.record(&event).await?;

        match &event.tenant_id {
            Some(tenant_id) => info!(tenant_id = %tenant_id, "Audit log created for tenant"),
            None => info!("Audit log created for admin user"),
        }

        Ok(())
    }

    /// Start consuming `queue`, bound under `routing_key`.
    pub fn start(self: Arc<Self>, bus: &Arc<MessageBus>, queue: &str, routing_key: &str) -> JoinHandle<()> {
        info!(queue = %queue, "Starting audit log worker");

        bus.consume_one_way(queue, routing_key, move |message| {
            let worker = Arc::clone(&self);
            async move { worker.process(message).await }
        })
    }
}
