//! Routes replies from the process mailbox to whoever is waiting on them.

use std::sync::Arc;

use tracing::{debug, warn};

use super::circuit_breaker::BreakerRegistry;
use super::correlation::CorrelationRegistry;
use crate::types::ServiceMessage;

/// Fan-in point for `<self>.responses`.
///
/// Guarded requests are tracked by their breaker, plain ones by the
/// correlation registry; a reply settles at most one of them.
#[derive(Clone)]
pub struct ReplyDispatcher {
    registry: Arc<CorrelationRegistry>,
    breakers: Arc<BreakerRegistry>,
}

impl ReplyDispatcher {
    pub fn new(registry: Arc<CorrelationRegistry>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { registry, breakers }
    }

    /// Settle the request `reply` answers. Returns whether one was waiting.
    pub fn dispatch(&self, reply: ServiceMessage) -> bool {
        let Some(correlation_id) = reply.correlation_id else {
            warn!(action = %reply.action, "Received reply without correlationId");
            return false;
        };

        if self
            .breakers
            .handle_response(&correlation_id, reply.data.clone(), reply.error.clone())
        {
            debug!(correlation_id = %correlation_id, "Reply settled guarded request");
            return true;
        }

        self.registry.settle(&correlation_id, reply.data, reply.error)
    }
}
