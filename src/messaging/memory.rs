//! In-process loopback publisher for exercising the messaging layer
//! without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::bus::Publisher;
use crate::types::ServiceMessage;

/// Routes published envelopes to subscribers by routing key.
pub struct InMemoryBroker {
    available: AtomicBool,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    published: Mutex<Vec<(String, ServiceMessage)>>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<ServiceMessage>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            failures_remaining: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Receive everything published under `routing_key`.
    pub fn subscribe(&self, routing_key: &str) -> mpsc::UnboundedReceiver<ServiceMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(routing_key.to_string(), sender);
        receiver
    }

    /// Simulate losing or regaining the transport.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Refuse the next `count` publishes.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Publish calls made, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successfully published envelopes, oldest first.
    pub fn published(&self) -> Vec<(String, ServiceMessage)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, routing_key: &str, message: &ServiceMessage) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return false;
        }

        let refused = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return false;
        }

        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), message.clone()));

        // Unbound routing keys are dropped, as on a direct exchange.
        if let Some(route) = self.routes.lock().unwrap().get(routing_key) {
            let _ = route.send(message.clone());
        }

        true
    }
}
