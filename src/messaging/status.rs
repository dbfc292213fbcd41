//! Point-in-time view of this process's messaging state.

use serde::Serialize;

use super::circuit_breaker::{BreakerRegistry, BreakerSnapshot};
use super::correlation::CorrelationRegistry;
use super::retry_queue::{RetryQueue, RetryQueueStats};

/// Served by `GET /messaging/status` and the `get-messaging-status` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingStatus {
    pub service: String,
    pub connected: bool,
    pub pending_requests: usize,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub retry_queue: RetryQueueStats,
}

impl MessagingStatus {
    pub fn collect(
        service: &str,
        connected: bool,
        registry: &CorrelationRegistry,
        breakers: &BreakerRegistry,
        retry_queue: &RetryQueue,
    ) -> Self {
        Self {
            service: service.to_string(),
            connected,
            pending_requests: registry.pending_count(),
            circuit_breakers: breakers.snapshots(),
            retry_queue: retry_queue.stats(),
        }
    }
}
