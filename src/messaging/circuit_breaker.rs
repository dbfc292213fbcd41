//! Circuit Breaker guarding request/reply calls to one downstream service.
//!
//! Stops sending to a service that keeps failing or timing out. The
//! transition out of OPEN is evaluated lazily on the next call attempt;
//! nothing runs in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bus::Publisher;
use super::correlation::{reply_outcome, round_trip, PendingRequests};
use crate::error::RpcError;
use crate::types::{requests_queue, BreakerConfig, ServiceMessage};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold reached - requests rejected immediately
    Open,
    /// Reset timeout elapsed - requests probe the service
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub pending_requests: usize,
}

/// Breaker for a single downstream service.
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    publisher: Arc<dyn Publisher>,
    reply_to: String,
    pending: PendingRequests,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker for `service`; replies are expected on `reply_to`.
    pub fn new(
        service: impl Into<String>,
        config: BreakerConfig,
        publisher: Arc<dyn Publisher>,
        reply_to: impl Into<String>,
    ) -> Self {
        let service = service.into();
        info!(service = %service, "Circuit breaker initialized");

        Self {
            service,
            config,
            publisher,
            reply_to: reply_to.into(),
            pending: PendingRequests::new(),
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Downstream service this breaker guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send a request through the breaker and wait for its reply.
    ///
    /// A refused publish, a timeout and an explicit error reply each count as
    /// one failure; a reply counts as one success. The breaker never retries.
    pub async fn execute_request(
        &self,
        routing_key: &str,
        message: ServiceMessage,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.admit()?;

        let outcome = round_trip(
            self.publisher.as_ref(),
            &self.pending,
            routing_key,
            message,
            &self.reply_to,
            timeout.unwrap_or(self.config.request_timeout),
        )
        .await;

        match &outcome {
            Ok(_) => self.on_success(),
            Err(e) => {
                debug!(service = %self.service, error = %e, "Guarded request failed");
                self.on_failure();
            }
        }

        outcome
    }

    /// Call `action` on the guarded service's request queue.
    pub async fn call(&self, action: &str, data: Value) -> Result<Value, RpcError> {
        let routing_key = requests_queue(&self.service);
        self.execute_request(&routing_key, ServiceMessage::new(action, data), None)
            .await
    }

    /// Settle one of this breaker's requests from a reply.
    ///
    /// Returns `false` if the correlation ID is not (or no longer) pending
    /// here. Outcome accounting happens in [`execute_request`](Self::execute_request),
    /// once per request.
    pub fn handle_response(&self, correlation_id: &str, data: Value, error: Option<String>) -> bool {
        self.pending.settle(correlation_id, reply_outcome(data, error))
    }

    /// Whether `correlation_id` is awaiting a reply on this breaker.
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains(correlation_id)
    }

    /// Gate a call attempt, moving OPEN to HALF_OPEN once the reset timeout
    /// has passed since the last failure.
    fn admit(&self) -> Result<(), RpcError> {
        let mut inner = self.lock();

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let since_failure = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);

        if since_failure > self.config.reset_timeout {
            self.transition_to(&mut inner, CircuitState::HalfOpen);
            return Ok(());
        }

        warn!(service = %self.service, "Circuit open - request rejected");
        Err(RpcError::CircuitOpen {
            service: self.service.clone(),
            retry_in: self.config.reset_timeout.saturating_sub(since_failure),
        })
    }

    /// Record a successful call
    fn on_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            // Single failure in half-open reopens
            CircuitState::HalfOpen => self.transition_to(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, inner: &mut BreakerState, new_state: CircuitState) {
        inner.state = new_state;

        match new_state {
            CircuitState::Open => {
                inner.success_count = 0;
                warn!(
                    service = %self.service,
                    failures = inner.failure_count,
                    reset_after_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit OPENED"
                );
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(service = %self.service, "Circuit HALF-OPEN, probing service");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                info!(service = %self.service, "Circuit CLOSED, normal operation resumed");
            }
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition_to(&mut inner, CircuitState::Closed);
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get statistics
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            pending_requests: self.pending.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide set of breakers keyed by downstream service name.
///
/// Built once at startup and shared by handle.
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// One breaker per service, all replying to the same mailbox.
    pub fn new(
        services: &[String],
        config: BreakerConfig,
        publisher: Arc<dyn Publisher>,
        reply_to: &str,
    ) -> Self {
        let breakers = services
            .iter()
            .map(|service| {
                let breaker = CircuitBreaker::new(service.as_str(), config, Arc::clone(&publisher), reply_to);
                (service.clone(), Arc::new(breaker))
            })
            .collect();

        Self { breakers }
    }

    /// Breaker for `service`, if one was configured.
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).cloned()
    }

    /// Route a reply to whichever breaker issued it.
    pub fn handle_response(&self, correlation_id: &str, data: Value, error: Option<String>) -> bool {
        match self.breakers.values().find(|b| b.is_pending(correlation_id)) {
            Some(breaker) => breaker.handle_response(correlation_id, data, error),
            None => false,
        }
    }

    /// Snapshots of every breaker, ordered by service name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use serde_json::json;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(10_000),
            half_open_success_threshold: 2,
            request_timeout: Duration::from_millis(5_000),
        }
    }

    fn breaker(broker: &Arc<InMemoryBroker>) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("tenant", config(), broker.clone(), "auth.responses"))
    }

    /// Answer every request on `tenant.requests` with `{"ok": true}`.
    fn spawn_responder(broker: &Arc<InMemoryBroker>, breaker: &Arc<CircuitBreaker>) {
        let mut requests = broker.subscribe("tenant.requests");
        let breaker = Arc::clone(breaker);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let Some(id) = request.correlation_id {
                    breaker.handle_response(&id, json!({"ok": true}), None);
                }
            }
        });
    }

    async fn trip(breaker: &CircuitBreaker, broker: &InMemoryBroker) {
        broker.set_available(false);
        for _ in 0..3 {
            let err = breaker.call("get-tenant", json!({})).await.unwrap_err();
            assert!(matches!(err, RpcError::TransportUnavailable { .. }));
        }
        broker.set_available(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_publishing() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);

        trip(&breaker, &broker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let attempts = broker.attempts();
        let err = breaker.call("get-tenant", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { ref service, .. } if service == "tenant"));
        assert_eq!(broker.attempts(), attempts);
        assert_eq!(breaker.snapshot().pending_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);
        spawn_responder(&broker, &breaker);

        trip(&breaker, &broker).await;

        tokio::time::advance(Duration::from_millis(9_000)).await;
        assert!(matches!(
            breaker.call("get-tenant", json!({})).await,
            Err(RpcError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let reply = breaker.call("get-tenant", json!({})).await.unwrap();
        assert_eq!(reply, json!({"ok": true}));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);

        breaker.call("get-tenant", json!({})).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);

        trip(&breaker, &broker).await;
        tokio::time::advance(Duration::from_millis(10_001)).await;

        // Nobody answers: the probe times out.
        let err = breaker.call("get-tenant", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(
            breaker.call("get-tenant", json!({})).await,
            Err(RpcError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_counts_as_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);

        let mut requests = broker.subscribe("tenant.requests");
        let responder = Arc::clone(&breaker);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let id = request.correlation_id.unwrap();
                responder.handle_response(&id, Value::Null, Some("Tenant not found".into()));
            }
        });

        let err = breaker.call("get-tenant", json!({"id": "t9"})).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { ref message } if message == "Tenant not found"));
        assert_eq!(breaker.snapshot().failure_count, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);
        spawn_responder(&broker, &breaker);

        broker.fail_next(2);
        assert!(breaker.call("get-tenant", json!({})).await.is_err());
        assert!(breaker.call("get-tenant", json!({})).await.is_err());
        assert_eq!(breaker.snapshot().failure_count, 2);

        breaker.call("get-tenant", json!({})).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);

        broker.fail_next(2);
        assert!(breaker.call("get-tenant", json!({})).await.is_err());
        assert!(breaker.call("get-tenant", json!({})).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_success_and_timeout_settle_independently() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);

        // Answer only the request for "fast"; "slow" times out.
        let mut requests = broker.subscribe("tenant.requests");
        let responder = Arc::clone(&breaker);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if request.action == "fast" {
                    let id = request.correlation_id.unwrap();
                    responder.handle_response(&id, json!({"fast": true}), None);
                }
            }
        });

        let (fast, slow) = tokio::join!(
            breaker.call("fast", json!({})),
            breaker.call("slow", json!({})),
        );

        assert_eq!(fast.unwrap(), json!({"fast": true}));
        assert!(matches!(slow, Err(RpcError::Timeout { .. })));

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.pending_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_discarded() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);
        let mut requests = broker.subscribe("tenant.requests");

        let err = breaker.call("get-tenant", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));

        let request = requests.recv().await.unwrap();
        let id = request.correlation_id.unwrap();
        assert!(!breaker.handle_response(&id, json!({"late": true}), None));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let broker = Arc::new(InMemoryBroker::new());
        let breaker = breaker(&broker);

        trip(&breaker, &broker).await;
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_routes_reply_to_issuing_breaker() {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = Arc::new(BreakerRegistry::new(
            &["tenant".to_string(), "audit".to_string()],
            config(),
            broker.clone(),
            "auth.responses",
        ));
        assert_eq!(registry.len(), 2);

        let mut requests = broker.subscribe("audit.requests");
        let routing = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let id = request.correlation_id.unwrap();
                assert!(routing.handle_response(&id, json!({"count": 2}), None));
            }
        });

        let audit = registry.get("audit").unwrap();
        let reply = audit.call("get-failed-login-attempts", json!({"email": "a@b.c"})).await.unwrap();
        assert_eq!(reply, json!({"count": 2}));

        assert!(!registry.handle_response("unknown", Value::Null, None));
        assert!(registry.get("billing").is_none());

        let services: Vec<_> = registry.snapshots().into_iter().map(|s| s.service).collect();
        assert_eq!(services, vec!["audit", "tenant"]);
    }
}
