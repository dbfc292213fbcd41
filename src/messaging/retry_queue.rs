//! In-memory retry queue for messages whose publish failed.
//!
//! Entries are retried by a periodic sweep with exponential backoff and
//! dropped after the configured number of attempts. Nothing is persisted:
//! entries do not survive a restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::bus::Publisher;
use crate::types::{RetryConfig, ServiceMessage};

/// A message waiting to be published again.
#[derive(Debug, Clone)]
pub struct RetryQueueEntry {
    pub routing_key: String,
    pub message: ServiceMessage,
    /// Failed retry attempts so far
    pub attempts: u32,
    pub next_attempt_at: Instant,
}

struct Slot {
    id: u64,
    entry: RetryQueueEntry,
}

/// Queue contents summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueueStats {
    pub total: usize,
    pub by_routing_key: BTreeMap<String, usize>,
    /// Entries dropped after exhausting their attempts
    pub dropped: u64,
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dropped: usize,
}

/// Retry queue with exponential backoff.
pub struct RetryQueue {
    publisher: Arc<dyn Publisher>,
    config: RetryConfig,
    entries: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl RetryQueue {
    pub fn new(publisher: Arc<dyn Publisher>, config: RetryConfig) -> Self {
        Self {
            publisher,
            config,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `message` for a retry after the initial delay.
    pub fn add(&self, routing_key: &str, message: ServiceMessage) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        info!(
            routing_key = %routing_key,
            action = %message.action,
            correlation_id = ?message.correlation_id,
            "Added message to retry queue"
        );

        self.lock().push(Slot {
            id,
            entry: RetryQueueEntry {
                routing_key: routing_key.to_string(),
                message,
                attempts: 0,
                next_attempt_at: Instant::now() + self.config.initial_delay,
            },
        });
    }

    /// Publish now, or hand the message to the queue if that fails.
    ///
    /// Returns whether the immediate publish succeeded; the caller does not
    /// wait for retries.
    pub async fn publish_or_enqueue(&self, routing_key: &str, message: ServiceMessage) -> bool {
        if self.publisher.publish(routing_key, &message).await {
            return true;
        }

        warn!(routing_key = %routing_key, action = %message.action, "Publish failed, queueing for retry");
        self.add(routing_key, message);
        false
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.config.initial_delay.saturating_mul(factor)
    }

    /// Retry every entry that is currently due.
    pub async fn process_due(&self) -> SweepReport {
        let now = Instant::now();
        let due: Vec<(u64, String, ServiceMessage)> = self
            .lock()
            .iter()
            .filter(|slot| slot.entry.next_attempt_at <= now)
            .map(|slot| (slot.id, slot.entry.routing_key.clone(), slot.entry.message.clone()))
            .collect();

        let mut report = SweepReport::default();

        for (id, routing_key, message) in due {
            let published = self.publisher.publish(&routing_key, &message).await;

            let mut entries = self.lock();
            let Some(index) = entries.iter().position(|slot| slot.id == id) else {
                continue;
            };

            if published {
                let slot = entries.remove(index);
                report.delivered += 1;
                info!(
                    routing_key = %routing_key,
                    action = %message.action,
                    attempts = slot.entry.attempts + 1,
                    "Successfully retried message"
                );
                continue;
            }

            let attempts = {
                let entry = &mut entries[index].entry;
                entry.attempts += 1;
                entry.attempts
            };

            if attempts >= self.config.max_attempts {
                entries.remove(index);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                report.dropped += 1;
                error!(
                    routing_key = %routing_key,
                    action = %message.action,
                    attempts,
                    "Failed to retry message after max attempts"
                );
            } else {
                let delay = self.backoff(attempts);
                entries[index].entry.next_attempt_at = Instant::now() + delay;
                report.rescheduled += 1;
                debug!(
                    routing_key = %routing_key,
                    action = %message.action,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled message for retry"
                );
            }
        }

        report
    }

    /// Run the sweep every `period` until the task is aborted.
    pub fn start(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);

        info!(interval_ms = period.as_millis() as u64, "Starting retry processor");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let report = queue.process_due().await;
                if report != SweepReport::default() {
                    debug!(?report, "Retry sweep finished");
                }
            }
        })
    }

    /// Snapshot of the queued entries, oldest first.
    pub fn entries(&self) -> Vec<RetryQueueEntry> {
        self.lock().iter().map(|slot| slot.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RetryQueueStats {
        let entries = self.lock();
        let mut by_routing_key = BTreeMap::new();
        for slot in entries.iter() {
            *by_routing_key.entry(slot.entry.routing_key.clone()).or_insert(0) += 1;
        }

        RetryQueueStats {
            total: entries.len(),
            by_routing_key,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
