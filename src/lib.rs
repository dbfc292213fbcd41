//! Service Bus Library
//!
//! Asynchronous RPC between backend services over RabbitMQ: request/reply
//! with correlation IDs, per-service circuit breakers and a retry queue for
//! fire-and-forget publishes.

pub mod api;
pub mod error;
pub mod messaging;
pub mod router;
pub mod types;
pub mod workers;

pub use error::{BusError, HandlerError, RpcError};
pub use messaging::{
    BreakerRegistry, CircuitBreaker, CircuitState, ConnectionManager, CorrelationRegistry, MessageBus,
    Publisher, ReplyDispatcher, ReplySink, RetryQueue,
};
pub use router::ActionRouter;
pub use types::{LoginEvent, MessagingConfig, ServiceMessage, ServiceRole};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::router::ActionRouter;
    pub use crate::types::*;
}

/// Direct exchange shared by all services
pub const DEFAULT_EXCHANGE: &str = "services";

/// Durable queue carrying login events to the audit service
pub const LOGIN_EVENTS_QUEUE: &str = "login_events";

/// Routing key login events are published under
pub const LOGIN_ROUTING_KEY: &str = "login";

/// Fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Deadline for a single broker connect attempt
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default request/reply deadline
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Consecutive failures before a circuit opens
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Time an open circuit waits before probing
pub const DEFAULT_BREAKER_RESET_TIMEOUT_MS: u64 = 10_000;

/// Half-open successes needed to close a circuit
pub const DEFAULT_BREAKER_HALF_OPEN_SUCCESSES: u32 = 2;

/// Retry queue sweep interval
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;

/// Publish attempts before a queued message is dropped
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubled after each failure
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1000;
