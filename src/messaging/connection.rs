//! RabbitMQ connection manager.
//!
//! Owns the single connection and channel of the process, declares the
//! broker topology after every successful connect and keeps reconnecting
//! with a fixed delay after any failure. Other components read the channel
//! through [`ConnectionManager::channel`]; only this module writes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use lapin::{
    options::*, types::FieldTable, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::types::MessagingConfig;

/// Queue options for durable work queues.
fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// Queue options for a process-private reply mailbox.
fn mailbox_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        auto_delete: true,
        ..Default::default()
    }
}

/// Kind of queue a consumer binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Survives broker restarts; used for requests and events
    Durable,
    /// Deleted with its last consumer; used for reply mailboxes
    Mailbox,
}

impl QueueKind {
    fn options(self) -> QueueDeclareOptions {
        match self {
            QueueKind::Durable => durable_queue(),
            QueueKind::Mailbox => mailbox_queue(),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<Connection>>,
    channel: Option<Channel>,
}

/// Broker settings the manager needs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub uri: String,
    pub exchange: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub requests_queue: String,
    pub responses_queue: String,
    pub login_events_queue: String,
    pub login_routing_key: String,
}

impl From<&MessagingConfig> for ConnectionSettings {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            uri: config.broker_url.clone(),
            exchange: config.exchange.clone(),
            reconnect_delay: config.reconnect_delay,
            connect_timeout: config.connect_timeout,
            requests_queue: config.requests_queue(),
            responses_queue: config.responses_queue(),
            login_events_queue: config.login_events_queue().to_string(),
            login_routing_key: config.login_routing_key().to_string(),
        }
    }
}

/// Owner of the process's broker connection.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: RwLock<ConnectionState>,
    connecting: AtomicBool,
    reconnect_scheduled: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager; no connection is attempted until [`connect`](Self::connect).
    pub fn new(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: RwLock::new(ConnectionState::default()),
            connecting: AtomicBool::new(false),
            reconnect_scheduled: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Exchange all services publish to.
    pub fn exchange(&self) -> &str {
        &self.settings.exchange
    }

    /// Fixed delay used for reconnects and consumer re-registration.
    pub fn retry_delay(&self) -> Duration {
        self.settings.reconnect_delay
    }

    /// Current channel, if one is open.
    pub fn channel(&self) -> Option<Channel> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .channel
            .as_ref()
            .filter(|channel| channel.status().connected())
            .cloned()
    }

    /// Whether a usable channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    /// Establish the connection, or return the existing channel.
    ///
    /// While another attempt is in flight this returns
    /// [`BusError::TransportUnavailable`] instead of waiting or starting a
    /// second attempt. A failed attempt schedules a reconnect.
    pub async fn connect(self: &Arc<Self>) -> Result<Channel, BusError> {
        match self.attempt().await {
            Ok(channel) => Ok(channel),
            Err(BusError::TransportUnavailable) => Err(BusError::TransportUnavailable),
            Err(e) => {
                error!(error = %e, "Failed to connect to RabbitMQ");
                self.schedule_reconnect(&Handle::current());
                Err(e)
            }
        }
    }

    /// One guarded connection attempt.
    async fn attempt(self: &Arc<Self>) -> Result<Channel, BusError> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::TransportUnavailable);
        }

        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Connection attempt already in progress");
            return Err(BusError::TransportUnavailable);
        }

        let result = self.establish().await;
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    async fn establish(self: &Arc<Self>) -> Result<Channel, BusError> {
        info!(uri = %self.settings.uri, "Attempting to connect to RabbitMQ");

        self.release().await;

        let connection = tokio::time::timeout(
            self.settings.connect_timeout,
            Connection::connect(&self.settings.uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BusError::ConnectTimeout(self.settings.connect_timeout))??;

        let handle = Handle::current();
        let manager = Arc::downgrade(self);
        connection.on_error(move |err| {
            error!(error = %err, "RabbitMQ connection error");
            if let Some(manager) = manager.upgrade() {
                manager.clear();
                manager.schedule_reconnect(&handle);
            }
        });

        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let handle = Handle::current();
        let manager = Arc::downgrade(self);
        channel.on_error(move |err| {
            error!(error = %err, "RabbitMQ channel error");
            if let Some(manager) = manager.upgrade() {
                manager.clear();
                manager.schedule_reconnect(&handle);
            }
        });

        self.declare_topology(&channel).await?;

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.connection = Some(Arc::new(connection));
            state.channel = Some(channel.clone());
        }

        info!(exchange = %self.settings.exchange, "Connected to RabbitMQ successfully");
        Ok(channel)
    }

    /// Declare the exchange, the durable queues and this process's mailbox.
    async fn declare_topology(&self, channel: &Channel) -> Result<(), BusError> {
        channel
            .exchange_declare(
                &self.settings.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.bind_queue(
            channel,
            &self.settings.login_events_queue,
            &self.settings.login_routing_key,
            QueueKind::Durable,
        )
        .await?;
        self.bind_queue(
            channel,
            &self.settings.requests_queue,
            &self.settings.requests_queue,
            QueueKind::Durable,
        )
        .await?;
        self.bind_queue(
            channel,
            &self.settings.responses_queue,
            &self.settings.responses_queue,
            QueueKind::Mailbox,
        )
        .await?;

        Ok(())
    }

    /// Declare `queue` and bind it to the exchange under `routing_key`.
    pub async fn bind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        routing_key: &str,
        kind: QueueKind,
    ) -> Result<(), BusError> {
        channel
            .queue_declare(queue, kind.options(), FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                &self.settings.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, routing_key = %routing_key, kind = ?kind, "Queue bound");
        Ok(())
    }

    /// Schedule a single reconnect loop.
    ///
    /// Overlapping triggers (a connection error racing a failed publish)
    /// collapse into the loop that is already scheduled.
    fn schedule_reconnect(self: &Arc<Self>, runtime: &Handle) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if self.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already scheduled");
            return;
        }

        let delay = self.settings.reconnect_delay;
        info!(delay_ms = delay.as_millis() as u64, "Scheduling RabbitMQ reconnect");

        let manager = Arc::clone(self);
        let task = runtime.spawn(async move {
            manager.reconnect_loop().await;
        });

        *lock(&self.reconnect_task) = Some(task);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let delay = self.settings.reconnect_delay;

        loop {
            tokio::time::sleep(delay).await;

            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match self.attempt().await {
                Ok(_) => break,
                Err(BusError::TransportUnavailable) => {
                    debug!("Reconnect skipped, another attempt is in progress");
                }
                Err(e) => warn!(error = %e, "Reconnect attempt failed, retrying"),
            }
        }

        self.reconnect_scheduled.store(false, Ordering::SeqCst);
    }

    /// Forget the current channel and connection without closing them.
    fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.channel = None;
        state.connection = None;
    }

    /// Close any existing channel and connection.
    async fn release(&self) {
        let (connection, channel) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            (state.connection.take(), state.channel.take())
        };

        if let Some(channel) = channel {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "Bye").await {
                    warn!(error = %e, "Error closing existing channel");
                }
            }
        }

        if let Some(connection) = connection {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "Bye").await {
                    warn!(error = %e, "Error closing existing connection");
                }
            }
        }
    }

    /// Stop reconnecting and close the connection.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        self.reconnect_scheduled.store(false, Ordering::SeqCst);

        self.release().await;
        info!("RabbitMQ connection closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
