//! Message bus: publish and consume primitives over the shared channel.
//!
//! Delivery is at-least-once. A handler that succeeds acks its delivery; a
//! transient failure nacks with requeue; a permanent failure or an
//! undecodable payload is dropped so a poison message cannot loop forever.
//! Every delivery is processed on its own task, so a slow handler never
//! holds up the channel.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, publisher_confirm::Confirmation, types::FieldTable,
    BasicProperties, Channel, Consumer,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionManager, QueueKind};
use super::reply::ReplySink;
use crate::error::{BusError, HandlerError};
use crate::types::ServiceMessage;

/// Prefetch window per consumer.
const CONSUMER_PREFETCH: u16 = 10;

/// Anything that can put a [`ServiceMessage`] on the exchange.
///
/// Returns `false` instead of failing when the transport is unavailable or
/// the broker refuses the message; the caller decides whether to retry.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: &str, message: &ServiceMessage) -> bool;
}

/// What to do with a delivery once its handler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    Drop,
}

impl Disposition {
    /// Map a handler outcome to a delivery disposition.
    pub fn from_outcome(outcome: &Result<(), HandlerError>) -> Self {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if e.requeue() => Disposition::Requeue,
            Err(_) => Disposition::Drop,
        }
    }
}

/// Broker properties for an outgoing envelope.
///
/// `correlationId` and `replyTo` are mirrored into the transport headers for
/// consumers that read those instead of the body.
pub fn publish_properties(message: &ServiceMessage) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(2) // Persistent
        .with_content_type("application/json".into());

    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }

    properties
}

/// Whether the broker took responsibility for a published message.
///
/// The channel runs in confirm mode, so every publish resolves to an ack or
/// a nack; only a nack is a refusal.
pub fn accepted(confirmation: &Confirmation) -> bool {
    !confirmation.is_nack()
}

/// Where the reply to an inbound request should go, if anywhere.
///
/// Transport headers win; the envelope body is the fallback.
pub fn reply_target(properties: &BasicProperties, message: &ServiceMessage) -> Option<(String, String)> {
    let reply_to = properties
        .reply_to()
        .as_ref()
        .map(|s| s.as_str().to_string())
        .or_else(|| message.reply_to.clone())?;
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|s| s.as_str().to_string())
        .or_else(|| message.correlation_id.clone())?;

    Some((reply_to, correlation_id))
}

/// Publish/consume facade over the connection manager.
pub struct MessageBus {
    connection: Arc<ConnectionManager>,
}

impl MessageBus {
    pub fn new(connection: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self { connection })
    }

    /// Whether the underlying channel is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn get_channel(&self) -> Option<Channel> {
        if let Some(channel) = self.connection.channel() {
            return Some(channel);
        }
        self.connection.connect().await.ok()
    }

    /// Consume one-way messages from a durable queue bound under `routing_key`.
    pub fn consume_one_way<F, Fut>(self: &Arc<Self>, queue: &str, routing_key: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(ServiceMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let queue_name = queue.to_string();

        self.supervise(queue, routing_key, QueueKind::Durable, move |delivery| {
            let handler = Arc::clone(&handler);
            let queue = queue_name.clone();
            async move {
                let message = match ServiceMessage::from_bytes(&delivery.data) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Dropping undecodable message");
                        finish(&delivery, Disposition::Drop).await;
                        return;
                    }
                };

                let action = message.action.clone();
                let outcome = handler(message).await;
                log_outcome(&queue, &action, &outcome);
                finish(&delivery, Disposition::from_outcome(&outcome)).await;
            }
        })
    }

    /// Consume requests, offering each handler a reply sink when the
    /// request names a reply queue.
    pub fn consume_request_reply<F, Fut>(self: &Arc<Self>, queue: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(ServiceMessage, Option<ReplySink>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let queue_name = queue.to_string();
        let publisher: Arc<dyn Publisher> = Arc::clone(self) as Arc<dyn Publisher>;

        self.supervise(queue, queue, QueueKind::Durable, move |delivery| {
            let handler = Arc::clone(&handler);
            let publisher = Arc::clone(&publisher);
            let queue = queue_name.clone();
            async move {
                let message = match ServiceMessage::from_bytes(&delivery.data) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Dropping undecodable request");
                        finish(&delivery, Disposition::Drop).await;
                        return;
                    }
                };

                let sink = reply_target(&delivery.properties, &message).map(|(reply_to, correlation_id)| {
                    ReplySink::new(publisher, reply_to, correlation_id)
                });

                let action = message.action.clone();
                let outcome = handler(message, sink).await;
                log_outcome(&queue, &action, &outcome);
                finish(&delivery, Disposition::from_outcome(&outcome)).await;
            }
        })
    }

    /// Drain this process's reply mailbox.
    ///
    /// Every decoded reply goes to `on_message` and is acknowledged;
    /// undecodable ones are dropped.
    pub fn consume_replies<F>(self: &Arc<Self>, queue: &str, on_message: F) -> JoinHandle<()>
    where
        F: Fn(ServiceMessage) + Send + Sync + 'static,
    {
        let on_message = Arc::new(on_message);
        let queue_name = queue.to_string();

        self.supervise(queue, queue, QueueKind::Mailbox, move |delivery| {
            let on_message = Arc::clone(&on_message);
            let queue = queue_name.clone();
            async move {
                match ServiceMessage::from_bytes(&delivery.data) {
                    Ok(message) => {
                        on_message(message);
                        finish(&delivery, Disposition::Ack).await;
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Error processing reply");
                        finish(&delivery, Disposition::Drop).await;
                    }
                }
            }
        })
    }

    /// Keep a consumer registered on `queue` for the life of the process.
    ///
    /// Registration failures and closed consumer streams are retried after
    /// the fixed reconnect delay.
    fn supervise<P, Fut>(
        self: &Arc<Self>,
        queue: &str,
        routing_key: &str,
        kind: QueueKind,
        process: P,
    ) -> JoinHandle<()>
    where
        P: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let bus = Arc::clone(self);
        let queue = queue.to_string();
        let routing_key = routing_key.to_string();

        tokio::spawn(async move {
            loop {
                match bus.open_consumer(&queue, &routing_key, kind).await {
                    Ok(mut consumer) => {
                        info!(queue = %queue, "Consuming messages");

                        while let Some(delivery) = consumer.next().await {
                            match delivery {
                                Ok(delivery) => {
                                    tokio::spawn(process(delivery));
                                }
                                Err(e) => {
                                    error!(queue = %queue, error = %e, "Consumer error");
                                    break;
                                }
                            }
                        }

                        warn!(queue = %queue, "Consumer stopped, re-registering");
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Failed to set up consumption, retrying");
                    }
                }

                tokio::time::sleep(bus.connection.retry_delay()).await;
            }
        })
    }

    async fn open_consumer(&self, queue: &str, routing_key: &str, kind: QueueKind) -> Result<Consumer, BusError> {
        let channel = self.get_channel().await.ok_or(BusError::TransportUnavailable)?;

        self.connection.bind_queue(&channel, queue, routing_key, kind).await?;
        channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        Ok(consumer)
    }
}

#[async_trait]
impl Publisher for MessageBus {
    async fn publish(&self, routing_key: &str, message: &ServiceMessage) -> bool {
        let Some(channel) = self.get_channel().await else {
            error!(routing_key = %routing_key, "Cannot publish message: RabbitMQ connection not available");
            return false;
        };

        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(routing_key = %routing_key, error = %e, "Failed to encode message");
                return false;
            }
        };

        let confirm = match channel
            .basic_publish(
                self.connection.exchange(),
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                publish_properties(message),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                error!(routing_key = %routing_key, error = %e, "Failed to publish message");
                return false;
            }
        };

        match confirm.await {
            Ok(confirmation) if !accepted(&confirmation) => {
                error!(routing_key = %routing_key, "Broker rejected message");
                false
            }
            Ok(_) => {
                debug!(routing_key = %routing_key, action = %message.action, "Published message");
                true
            }
            Err(e) => {
                error!(routing_key = %routing_key, error = %e, "Failed to publish message");
                false
            }
        }
    }
}

fn log_outcome(queue: &str, action: &str, outcome: &Result<(), HandlerError>) {
    match outcome {
        Ok(()) => debug!(queue = %queue, action = %action, "Processed message"),
        Err(e) => error!(queue = %queue, action = %action, error = %e, "Error processing message"),
    }
}

async fn finish(delivery: &Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Disposition::Requeue | Disposition::Drop => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: disposition == Disposition::Requeue,
                    ..Default::default()
                })
                .await
        }
    };

    if let Err(e) = result {
        error!(error = %e, disposition = ?disposition, "Failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disposition_from_outcome() {
        assert_eq!(Disposition::from_outcome(&Ok(())), Disposition::Ack);
        assert_eq!(
            Disposition::from_outcome(&Err(HandlerError::Transient("db".into()))),
            Disposition::Requeue
        );
        assert_eq!(
            Disposition::from_outcome(&Err(HandlerError::Permanent("bad".into()))),
            Disposition::Drop
        );
    }

    #[test]
    fn test_publish_properties_mirror_metadata() {
        let message = ServiceMessage::new("get-tenant", json!({"id": "t1"}))
            .with_reply_to("c-1", "auth.responses");
        let properties = publish_properties(&message);

        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("c-1")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|s| s.as_str()),
            Some("auth.responses")
        );
    }

    #[test]
    fn test_one_way_properties_have_no_reply_metadata() {
        let properties = publish_properties(&ServiceMessage::new("login-event", json!({})));
        assert!(properties.correlation_id().is_none());
        assert!(properties.reply_to().is_none());
    }

    #[test]
    fn test_broker_nack_is_a_failed_publish() {
        assert!(accepted(&Confirmation::Ack(None)));
        assert!(!accepted(&Confirmation::Nack(None)));
    }

    #[test]
    fn test_reply_target_prefers_headers() {
        let message = ServiceMessage::new("x", json!({})).with_reply_to("body-id", "body.responses");
        let properties = BasicProperties::default()
            .with_correlation_id("header-id".into())
            .with_reply_to("header.responses".into());

        assert_eq!(
            reply_target(&properties, &message),
            Some(("header.responses".to_string(), "header-id".to_string()))
        );
    }

    #[test]
    fn test_reply_target_falls_back_to_body() {
        let message = ServiceMessage::new("x", json!({})).with_reply_to("c-2", "audit.responses");
        assert_eq!(
            reply_target(&BasicProperties::default(), &message),
            Some(("audit.responses".to_string(), "c-2".to_string()))
        );
    }

    #[test]
    fn test_no_reply_target_without_reply_to() {
        let message = ServiceMessage::new("x", json!({}));
        assert_eq!(reply_target(&BasicProperties::default(), &message), None);
    }
}
