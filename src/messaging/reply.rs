//! Reply sink handed to request handlers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::bus::Publisher;
use crate::types::ServiceMessage;

/// One-shot reply channel bound to an inbound request's metadata.
///
/// Every method takes `self` by value, so a handler can reply at most once.
pub struct ReplySink {
    publisher: Arc<dyn Publisher>,
    reply_to: String,
    correlation_id: String,
}

impl ReplySink {
    pub fn new(publisher: Arc<dyn Publisher>, reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            publisher,
            reply_to: reply_to.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Queue the reply goes to.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Correlation ID echoed on the reply.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Reply with a payload.
    pub async fn send(self, data: Value) -> bool {
        let reply = ServiceMessage::reply(self.correlation_id.as_str(), data);
        self.deliver(reply).await
    }

    /// Reply with a serializable payload.
    pub async fn respond<T: Serialize>(self, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(data) => self.send(data).await,
            Err(e) => {
                warn!(correlation_id = %self.correlation_id, error = %e, "Failed to encode reply payload");
                self.fail(format!("Failed to encode reply: {e}")).await
            }
        }
    }

    /// Reply with an explicit error; the caller's request rejects.
    pub async fn fail(self, error: impl Into<String>) -> bool {
        let reply = ServiceMessage::error_reply(self.correlation_id.as_str(), error);
        self.deliver(reply).await
    }

    async fn deliver(self, reply: ServiceMessage) -> bool {
        let published = self.publisher.publish(&self.reply_to, &reply).await;
        if published {
            debug!(reply_to = %self.reply_to, correlation_id = %self.correlation_id, "Reply sent");
        } else {
            warn!(reply_to = %self.reply_to, correlation_id = %self.correlation_id, "Failed to send reply");
        }
        published
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink")
            .field("reply_to", &self.reply_to)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use crate::types::REPLY_ACTION;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_publishes_reply_envelope() {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = ReplySink::new(broker.clone(), "auth.responses", "c-1");

        assert!(sink.send(json!({"verified": true})).await);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let (routing_key, reply) = &published[0];
        assert_eq!(routing_key, "auth.responses");
        assert_eq!(reply.action, REPLY_ACTION);
        assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(reply.data, json!({"verified": true}));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_fail_sets_envelope_error() {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = ReplySink::new(broker.clone(), "audit.responses", "c-2");

        assert!(sink.fail("Tenant ID is required").await);

        let (_, reply) = broker.published().remove(0);
        assert_eq!(reply.error.as_deref(), Some("Tenant ID is required"));
    }

    #[tokio::test]
    async fn test_send_reports_unavailable_transport() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let sink = ReplySink::new(broker.clone(), "auth.responses", "c-3");

        assert!(!sink.respond(&json!({"count": 0})).await);
        assert!(broker.published().is_empty());
    }
}
