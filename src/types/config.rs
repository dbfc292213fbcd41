//! Configuration types for the messaging layer.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_BREAKER_FAILURE_THRESHOLD, DEFAULT_BREAKER_HALF_OPEN_SUCCESSES,
    DEFAULT_BREAKER_RESET_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EXCHANGE, DEFAULT_RECONNECT_DELAY_MS,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_INTERVAL_MS,
    DEFAULT_RETRY_MAX_ATTEMPTS, LOGIN_EVENTS_QUEUE, LOGIN_ROUTING_KEY,
};

/// Which of the three services this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Auth,
    Tenant,
    Audit,
}

impl ServiceRole {
    /// Service name used to derive queue names.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceRole::Auth => "auth",
            ServiceRole::Tenant => "tenant",
            ServiceRole::Audit => "audit",
        }
    }

    /// Services this role calls by default.
    pub fn default_downstreams(&self) -> Vec<String> {
        let names: &[&str] = match self {
            ServiceRole::Auth => &["tenant", "audit"],
            ServiceRole::Tenant => &["auth", "audit"],
            ServiceRole::Audit => &["tenant"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Default HTTP port.
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceRole::Auth => 3001,
            ServiceRole::Tenant => 3002,
            ServiceRole::Audit => 3003,
        }
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(ServiceRole::Auth),
            "tenant" => Ok(ServiceRole::Tenant),
            "audit" => Ok(ServiceRole::Audit),
            other => Err(format!("unknown service role: {other}")),
        }
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Request queue name for a service.
pub fn requests_queue(service: &str) -> String {
    format!("{service}.requests")
}

/// Reply mailbox name for a service.
pub fn responses_queue(service: &str) -> String {
    format!("{service}.responses")
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close again
    pub half_open_success_threshold: u32,
    /// Default round-trip deadline for guarded requests
    pub request_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            reset_timeout: Duration::from_millis(DEFAULT_BREAKER_RESET_TIMEOUT_MS),
            half_open_success_threshold: DEFAULT_BREAKER_HALF_OPEN_SUCCESSES,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Retry queue schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Sweep interval of the retry processor
    pub interval: Duration,
    /// Publish attempts before an entry is dropped
    pub max_attempts: u32,
    /// Base delay, doubled after each failed attempt
    pub initial_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
        }
    }
}

/// Process-wide messaging configuration.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// AMQP URI of the broker
    pub broker_url: String,

    /// Role of this process
    pub role: ServiceRole,

    /// Direct exchange shared by all services
    pub exchange: String,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Deadline for a single connect attempt
    pub connect_timeout: Duration,

    /// Default deadline for un-guarded requests
    pub request_timeout: Duration,

    /// Services this process calls through a circuit breaker
    pub downstream_services: Vec<String>,

    pub breaker: BreakerConfig,

    pub retry: RetryConfig,

    /// HTTP listen port
    pub port: u16,

    /// Emit JSON logs instead of the human-readable format
    pub json_logs: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        let role = ServiceRole::Auth;
        Self {
            broker_url: "amqp://localhost".to_string(),
            role,
            exchange: DEFAULT_EXCHANGE.to_string(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            downstream_services: role.default_downstreams(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            port: role.default_port(),
            json_logs: false,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let role = std::env::var("SERVICE_NAME")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(ServiceRole::Auth);

        let request_timeout = Duration::from_millis(env_or("REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS));

        Self {
            broker_url: std::env::var("RABBITMQ_URL")
                .unwrap_or_else(|_| "amqp://localhost".to_string()),
            role,
            exchange: std::env::var("EXCHANGE_NAME")
                .unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string()),
            reconnect_delay: Duration::from_millis(env_or("RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)),
            connect_timeout: Duration::from_millis(env_or("CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)),
            request_timeout,
            downstream_services: std::env::var("DOWNSTREAM_SERVICES")
                .map(|s| parse_list(&s))
                .unwrap_or_else(|_| role.default_downstreams()),
            breaker: BreakerConfig {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", DEFAULT_BREAKER_FAILURE_THRESHOLD),
                reset_timeout: Duration::from_millis(env_or(
                    "BREAKER_RESET_TIMEOUT_MS",
                    DEFAULT_BREAKER_RESET_TIMEOUT_MS,
                )),
                half_open_success_threshold: env_or(
                    "BREAKER_HALF_OPEN_SUCCESSES",
                    DEFAULT_BREAKER_HALF_OPEN_SUCCESSES,
                ),
                request_timeout,
            },
            retry: RetryConfig {
                interval: Duration::from_millis(env_or("RETRY_INTERVAL_MS", DEFAULT_RETRY_INTERVAL_MS)),
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                initial_delay: Duration::from_millis(env_or(
                    "RETRY_INITIAL_DELAY_MS",
                    DEFAULT_RETRY_INITIAL_DELAY_MS,
                )),
            },
            port: env_or("PORT", role.default_port()),
            json_logs: std::env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    /// This process's service name.
    pub fn service_name(&self) -> &'static str {
        self.role.name()
    }

    /// Queue this process serves requests from.
    pub fn requests_queue(&self) -> String {
        requests_queue(self.service_name())
    }

    /// This process's reply mailbox.
    pub fn responses_queue(&self) -> String {
        responses_queue(self.service_name())
    }

    /// Durable one-way queue for login events.
    pub fn login_events_queue(&self) -> &'static str {
        LOGIN_EVENTS_QUEUE
    }

    /// Routing key login events are bound under.
    pub fn login_routing_key(&self) -> &'static str {
        LOGIN_ROUTING_KEY
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
