//! Correlation registry for request/reply over one-way delivery.
//!
//! Each outbound request gets a fresh correlation ID and a pending slot with
//! its own timer. Whichever comes first, the matching reply or the timer,
//! removes the slot and settles the caller exactly once. Late or duplicate
//! replies find no slot and are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::Publisher;
use crate::error::RpcError;
use crate::types::{requests_queue, ServiceMessage};

/// Outcome delivered to a waiting caller.
pub type Settlement = Result<Value, RpcError>;

/// A request waiting for its reply.
struct PendingRequest {
    sender: oneshot::Sender<Settlement>,
    timer: JoinHandle<()>,
}

/// Table of in-flight requests keyed by correlation ID.
///
/// Cloning shares the same table. Timer tasks hold a handle to it so an
/// expired slot is freed even when the caller stopped waiting.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot for `correlation_id` that expires after `timeout`.
    pub fn register(
        &self,
        correlation_id: &str,
        target: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Settlement> {
        let (sender, receiver) = oneshot::channel();
        let started = Instant::now();
        let deadline = started + timeout;

        // Hold the lock while spawning so the timer can never observe the
        // table before its own slot is inserted.
        let mut table = lock(&self.inner);

        let inner = Arc::clone(&self.inner);
        let id = correlation_id.to_string();
        let target = target.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let expired = lock(&inner).remove(&id);
            if let Some(request) = expired {
                let elapsed = started.elapsed();
                warn!(
                    correlation_id = %id,
                    target = %target,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request timed out"
                );
                let _ = request.sender.send(Err(RpcError::Timeout { target, elapsed }));
            }
        });

        if let Some(previous) = table.insert(
            correlation_id.to_string(),
            PendingRequest { sender, timer },
        ) {
            // IDs are fresh v4 UUIDs; a collision means a caller reused one.
            previous.timer.abort();
            warn!(correlation_id = %correlation_id, "Replaced pending request with reused correlation ID");
        }

        receiver
    }

    /// Settle the slot for `correlation_id`.
    ///
    /// Returns `false` when no slot exists (already settled, timed out, or
    /// never issued by this table).
    pub fn settle(&self, correlation_id: &str, outcome: Settlement) -> bool {
        let request = lock(&self.inner).remove(correlation_id);

        match request {
            Some(request) => {
                request.timer.abort();
                if request.sender.send(outcome).is_err() {
                    debug!(correlation_id = %correlation_id, "Caller stopped waiting before settlement");
                }
                true
            }
            None => false,
        }
    }

    /// Drop a slot without settling it.
    pub fn discard(&self, correlation_id: &str) {
        if let Some(request) = lock(&self.inner).remove(correlation_id) {
            request.timer.abort();
        }
    }

    /// Whether a slot exists for `correlation_id`.
    pub fn contains(&self, correlation_id: &str) -> bool {
        lock(&self.inner).contains_key(correlation_id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Convert a reply into the caller's settlement.
pub(crate) fn reply_outcome(data: Value, error: Option<String>) -> Settlement {
    match error {
        Some(message) => Err(RpcError::Remote { message }),
        None => Ok(data),
    }
}

/// Publish `message` as a request and wait for its reply.
///
/// Shared by the registry and the circuit breakers: a fresh correlation ID,
/// a slot in `pending`, then the publish. A refused publish frees the slot
/// and fails immediately instead of waiting out the timer. The timer also
/// covers the publish itself, so a stalled broker cannot hold the caller
/// past its deadline.
pub(crate) async fn round_trip(
    publisher: &dyn Publisher,
    pending: &PendingRequests,
    routing_key: &str,
    message: ServiceMessage,
    reply_to: &str,
    timeout: Duration,
) -> Settlement {
    let correlation_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let mut receiver = pending.register(&correlation_id, routing_key, timeout);

    let message = message.with_reply_to(correlation_id.as_str(), reply_to);

    tokio::select! {
        published = publisher.publish(routing_key, &message) => {
            if !published {
                pending.discard(&correlation_id);
                return Err(RpcError::TransportUnavailable {
                    routing_key: routing_key.to_string(),
                });
            }
        }
        outcome = &mut receiver => {
            warn!(correlation_id = %correlation_id, routing_key = %routing_key, "Request settled before publish completed");
            return settlement(outcome, routing_key, started);
        }
    }

    debug!(
        correlation_id = %correlation_id,
        routing_key = %routing_key,
        action = %message.action,
        "Request sent, awaiting reply"
    );

    settlement(receiver.await, routing_key, started)
}

fn settlement(received: Result<Settlement, RecvError>, routing_key: &str, started: Instant) -> Settlement {
    match received {
        Ok(outcome) => outcome,
        Err(_) => Err(RpcError::Timeout {
            target: routing_key.to_string(),
            elapsed: started.elapsed(),
        }),
    }
}

/// Process-wide registry for plain (unguarded) service requests.
pub struct CorrelationRegistry {
    publisher: Arc<dyn Publisher>,
    reply_to: String,
    default_timeout: Duration,
    pending: PendingRequests,
}

impl CorrelationRegistry {
    /// Create a registry whose replies come back to `reply_to`.
    pub fn new(publisher: Arc<dyn Publisher>, reply_to: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            publisher,
            reply_to: reply_to.into(),
            default_timeout,
            pending: PendingRequests::new(),
        }
    }

    /// Send `action` to `service` and wait for the reply payload.
    ///
    /// The request goes to `<service>.requests`. Without an explicit
    /// `timeout` the registry default applies.
    pub async fn send(
        &self,
        service: &str,
        action: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let routing_key = requests_queue(service);
        let message = ServiceMessage::new(action, data);

        round_trip(
            self.publisher.as_ref(),
            &self.pending,
            &routing_key,
            message,
            &self.reply_to,
            timeout.unwrap_or(self.default_timeout),
        )
        .await
    }

    /// Settle a pending request from a reply.
    ///
    /// Unknown IDs are logged and ignored.
    pub fn settle(&self, correlation_id: &str, data: Value, error: Option<String>) -> bool {
        let settled = self.pending.settle(correlation_id, reply_outcome(data, error));
        if !settled {
            warn!(correlation_id = %correlation_id, "Received response with unknown correlationId");
        }
        settled
    }

    /// Reply mailbox this registry listens on.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
