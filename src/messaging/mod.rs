//! # Messaging
//!
//! Asynchronous RPC between services over a RabbitMQ direct exchange.
//!
//! ## Components
//! - [`ConnectionManager`]: one connection and channel per process, with
//!   single-flight reconnect and topology setup
//! - [`MessageBus`]: publish plus one-way, request/reply and reply-mailbox
//!   consumers
//! - [`CorrelationRegistry`]: request/reply over one-way delivery with a
//!   timer per request
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: fail fast on unhealthy services
//! - [`RetryQueue`]: backoff retries for fire-and-forget publishes
//! - [`ReplyDispatcher`]: settles whichever request a reply answers

pub mod bus;
pub mod circuit_breaker;
pub mod connection;
pub mod correlation;
pub mod replies;
pub mod reply;
pub mod retry_queue;
pub mod status;

#[cfg(test)]
pub(crate) mod memory;

pub use bus::{MessageBus, Publisher};
pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use correlation::{CorrelationRegistry, PendingRequests};
pub use replies::ReplyDispatcher;
pub use reply::ReplySink;
pub use retry_queue::{RetryQueue, RetryQueueEntry, RetryQueueStats};
pub use status::MessagingStatus;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use tokio::task::JoinHandle;

    use super::memory::InMemoryBroker;
    use super::*;
    use crate::error::RpcError;
    use crate::router::ActionRouter;
    use crate::types::{payload_error, BreakerConfig, ServiceMessage};

    #[derive(Deserialize)]
    struct GetWidget {
        id: String,
    }

    /// Serve `service`'s request queue with `router`, replying over the broker.
    fn serve(broker: &Arc<InMemoryBroker>, service: &str, router: ActionRouter) -> JoinHandle<()> {
        let mut requests = broker.subscribe(&format!("{service}.requests"));
        let publisher: Arc<dyn Publisher> = broker.clone();

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let sink = match (&request.reply_to, &request.correlation_id) {
                    (Some(reply_to), Some(id)) => Some(ReplySink::new(Arc::clone(&publisher), reply_to, id)),
                    _ => None,
                };
                let _ = router.dispatch(request, sink).await;
            }
        })
    }

    /// Drain the caller's mailbox into `dispatcher`.
    fn listen(broker: &Arc<InMemoryBroker>, mailbox: &str, dispatcher: ReplyDispatcher) -> JoinHandle<()> {
        let mut replies = broker.subscribe(mailbox);
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                dispatcher.dispatch(reply);
            }
        })
    }

    fn widgets() -> ActionRouter {
        ActionRouter::new("x").route("get-widget", |request: GetWidget| async move {
            Ok(json!({ "widget": { "id": request.id } }))
        })
    }

    fn caller(broker: &Arc<InMemoryBroker>) -> (Arc<CorrelationRegistry>, Arc<BreakerRegistry>) {
        let registry = Arc::new(CorrelationRegistry::new(
            broker.clone(),
            "caller.responses",
            Duration::from_secs(5),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            &["x".to_string(), "slow".to_string()],
            BreakerConfig::default(),
            broker.clone(),
            "caller.responses",
        ));
        listen(
            broker,
            "caller.responses",
            ReplyDispatcher::new(Arc::clone(&registry), Arc::clone(&breakers)),
        );
        (registry, breakers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_through_router() {
        let broker = Arc::new(InMemoryBroker::new());
        serve(&broker, "x", widgets());
        let (registry, _) = caller(&broker);

        let result = registry
            .send("x", "get-widget", json!({"id": "w1"}), None)
            .await
            .unwrap();

        assert_eq!(result, json!({"widget": {"id": "w1"}}));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_action_resolves_with_error_payload() {
        let broker = Arc::new(InMemoryBroker::new());
        serve(&broker, "x", widgets());
        let (registry, _) = caller(&broker);

        let result = registry
            .send("x", "nonexistent", json!({}), None)
            .await
            .unwrap();

        assert_eq!(result, json!({"error": "Unknown action", "action": "nonexistent"}));
        assert!(matches!(
            payload_error(&result),
            Some(RpcError::UnknownAction { action }) if action == "nonexistent"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_round_trip_settles_through_dispatcher() {
        let broker = Arc::new(InMemoryBroker::new());
        serve(&broker, "x", widgets());
        let (registry, breakers) = caller(&broker);

        let breaker = breakers.get("x").unwrap();
        let result = breaker.call("get-widget", json!({"id": "w2"})).await.unwrap();

        assert_eq!(result, json!({"widget": {"id": "w2"}}));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_success_and_timeout_settle_independently() {
        let broker = Arc::new(InMemoryBroker::new());
        let (_, breakers) = caller(&broker);
        let breaker = breakers.get("x").unwrap();

        // Answers only the first request it sees.
        let mut requests = broker.subscribe("x.requests");
        let publisher: Arc<dyn Publisher> = broker.clone();
        tokio::spawn(async move {
            let first = requests.recv().await.unwrap();
            let sink = ReplySink::new(
                publisher,
                first.reply_to.clone().unwrap(),
                first.correlation_id.clone().unwrap(),
            );
            sink.send(json!({"ok": true})).await;
            while requests.recv().await.is_some() {}
        });

        let (answered, abandoned) = tokio::join!(
            breaker.call("get-widget", json!({"id": "a"})),
            breaker.call("get-widget", json!({"id": "b"})),
        );

        assert_eq!(answered.unwrap(), json!({"ok": true}));
        assert!(matches!(abandoned, Err(RpcError::Timeout { .. })));

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.pending_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_discarded() {
        let broker = Arc::new(InMemoryBroker::new());
        let (registry, _) = caller(&broker);
        let mut requests = broker.subscribe("slow.requests");

        let result = registry
            .send("slow", "get-widget", json!({}), Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));

        let request = requests.recv().await.unwrap();
        let publisher: Arc<dyn Publisher> = broker.clone();
        let sink = ReplySink::new(publisher, "caller.responses", request.correlation_id.unwrap());
        assert!(sink.send(json!({"late": true})).await);

        tokio::task::yield_now().await;
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_way_request_gets_no_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut replies = broker.subscribe("caller.responses");
        serve(&broker, "x", widgets());

        assert!(broker.publish("x.requests", &ServiceMessage::new("get-widget", json!({"id": "w3"}))).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(replies.try_recv().is_err());
    }
}
