//! Core types for the messaging layer.

mod config;
mod message;

pub use config::{
    requests_queue, responses_queue, BreakerConfig, MessagingConfig, RetryConfig, ServiceRole,
};
pub use message::{
    payload_error, LoginEvent, ServiceMessage, LOGIN_EVENT_ACTION, REPLY_ACTION,
};
