//! Durable queue channel with automatic reconnection.
//!
//! [`QueueChannel`] owns the broker connection for one process. It declares
//! the topology (work queue, retry delay queue, dead-letter queue) on every
//! (re)connect, and a background supervisor reconnects with capped
//! exponential backoff whenever the connection drops.
//!
//! While disconnected, every operation fails fast with
//! [`AnvilError::NotConnected`] instead of blocking, so callers can tell
//! "broker unavailable" apart from other failures.

use super::{
    BrokerConnection, BrokerConnector, DeliveryStream, OutboundMessage, PublishAck, QueueStats,
    Topology,
};
use crate::codec::{EnvelopeCodec, JsonCodec};
use crate::config::{AnvilConfig, ConfirmMode, ReconnectPolicy};
use crate::envelope::TaskEnvelope;
use crate::error::{AnvilError, AnvilResult};
use crate::utils::calculate_backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connection state of a [`QueueChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// First connection attempt in progress
    Connecting,
    /// Connected and topology declared
    Connected,
    /// Connection lost; the supervisor is reconnecting
    Disconnected,
    /// Unrecoverable error; no further reconnects
    Failed(String),
    /// Closed by the application
    Closed,
}

struct ChannelInner {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    reconnect: ReconnectPolicy,
    confirm_mode: ConfirmMode,
    publish_timeout: Duration,
    codec: Arc<dyn EnvelopeCodec>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    status: watch::Sender<ChannelStatus>,
    shutdown: watch::Sender<bool>,
    published: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    reconnects: AtomicU64,
}

impl ChannelInner {
    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_connection(&self, connection: Option<Arc<dyn BrokerConnection>>) {
        *self
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = connection;
    }

    /// The live connection, or the error explaining why there is none.
    fn connection(&self) -> AnvilResult<Arc<dyn BrokerConnection>> {
        match self.current() {
            Some(connection) if connection.is_connected() => Ok(connection),
            _ => match &*self.status.borrow() {
                ChannelStatus::Failed(message) => Err(AnvilError::fatal(message.clone())),
                _ => Err(AnvilError::NotConnected),
            },
        }
    }

    /// Connect and declare the whole topology.
    async fn connect_once(&self) -> AnvilResult<Arc<dyn BrokerConnection>> {
        let connection = self.connector.connect().await?;
        for spec in self.topology.queues() {
            if let Err(e) = connection.declare(spec).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        Ok(connection)
    }

    async fn send(&self, queue: &str, message: OutboundMessage) -> AnvilResult<PublishAck> {
        self.send_with(queue, message, self.confirm_mode).await
    }

    /// Retry and dead-letter copies replace a delivery that is acked right
    /// after, so they always wait for the broker whatever producers use.
    async fn send_confirmed(
        &self,
        queue: &str,
        message: OutboundMessage,
    ) -> AnvilResult<PublishAck> {
        self.send_with(queue, message, ConfirmMode::BrokerConfirm).await
    }

    async fn send_with(
        &self,
        queue: &str,
        message: OutboundMessage,
        mode: ConfirmMode,
    ) -> AnvilResult<PublishAck> {
        let connection = self.connection()?;
        tokio::time::timeout(self.publish_timeout, connection.publish(queue, message, mode))
            .await
            .map_err(|_| AnvilError::Timeout {
                timeout_ms: self.publish_timeout.as_millis() as u64,
            })?
    }

    fn outbound(&self, envelope: &TaskEnvelope) -> AnvilResult<OutboundMessage> {
        let body = self.codec.encode(envelope)?;
        let mut message = OutboundMessage::persistent(body, self.codec.content_type());
        message.message_id = Some(envelope.id.clone());
        message.headers = vec![
            ("x-pattern".to_string(), envelope.pattern.clone()),
            ("x-attempt".to_string(), envelope.attempt_count.to_string()),
        ];
        Ok(message)
    }
}

/// Connection-owning handle to the task queue.
///
/// Cheap to share behind an [`Arc`]; submitters and workers all use the same
/// channel.
pub struct QueueChannel {
    inner: Arc<ChannelInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl QueueChannel {
    /// Open a channel using the JSON codec.
    ///
    /// A transient connection failure is not an error: the channel starts
    /// [`ChannelStatus::Disconnected`] and keeps retrying in the background.
    /// Fatal errors (bad credentials, a queue declared with different
    /// settings) are returned immediately.
    pub async fn open(
        connector: Arc<dyn BrokerConnector>,
        config: &AnvilConfig,
    ) -> AnvilResult<Arc<Self>> {
        Self::open_with_codec(connector, config, Arc::new(JsonCodec)).await
    }

    /// Open a channel with a custom envelope codec.
    pub async fn open_with_codec(
        connector: Arc<dyn BrokerConnector>,
        config: &AnvilConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> AnvilResult<Arc<Self>> {
        let (status, _) = watch::channel(ChannelStatus::Connecting);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(ChannelInner {
            connector,
            topology: Topology::from_config(&config.queue),
            reconnect: config.broker.reconnect.clone(),
            confirm_mode: config.publisher.confirm_mode,
            publish_timeout: config.publisher.publish_timeout(),
            codec,
            connection: RwLock::new(None),
            status,
            shutdown,
            published: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });

        let target = inner.connector.describe();
        match inner.connect_once().await {
            Ok(connection) => {
                inner.set_connection(Some(connection));
                inner.status.send_replace(ChannelStatus::Connected);
                tracing::info!(
                    "Queue channel connected to {} (queue: {})",
                    target,
                    inner.topology.work.name
                );
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("Queue channel setup failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Broker {} unavailable, retrying in background: {}", target, e);
                inner.status.send_replace(ChannelStatus::Disconnected);
            }
        }

        let supervisor = tokio::spawn(supervise(inner.clone()));

        Ok(Arc::new(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }

    /// Current connection state.
    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Whether operations can reach the broker right now.
    pub fn is_connected(&self) -> bool {
        self.inner.connection().is_ok()
    }

    /// Wait until connected; fails if the channel failed or was closed.
    pub async fn wait_connected(&self) -> AnvilResult<()> {
        let mut changes = self.inner.status.subscribe();
        let status = changes
            .wait_for(|status| {
                !matches!(
                    status,
                    ChannelStatus::Connecting | ChannelStatus::Disconnected
                )
            })
            .await
            .map_err(|_| AnvilError::NotRunning)?
            .clone();

        match status {
            ChannelStatus::Connected => Ok(()),
            ChannelStatus::Failed(message) => Err(AnvilError::fatal(message)),
            ChannelStatus::Closed => Err(AnvilError::NotRunning),
            ChannelStatus::Connecting | ChannelStatus::Disconnected => {
                Err(AnvilError::NotConnected)
            }
        }
    }

    /// Name of the work queue.
    pub fn queue_name(&self) -> &str {
        &self.inner.topology.work.name
    }

    /// Declared topology.
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Codec used for envelopes on this channel.
    pub fn codec(&self) -> Arc<dyn EnvelopeCodec> {
        self.inner.codec.clone()
    }

    /// Whether failed tasks can be parked in a dead-letter queue.
    pub fn has_dead_letter_queue(&self) -> bool {
        self.inner.topology.dead_letter.is_some()
    }

    /// Publish a new envelope to the work queue.
    ///
    /// Returns only once the broker has confirmed it (or, without publisher
    /// confirms, once the bytes are written).
    pub async fn publish(&self, envelope: &TaskEnvelope) -> AnvilResult<PublishAck> {
        let message = self.inner.outbound(envelope)?;
        let ack = self
            .inner
            .send(&self.inner.topology.work.name, message)
            .await?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Published task {} ({})", envelope.id, envelope.pattern);
        Ok(ack)
    }

    /// Publish another attempt of a task.
    ///
    /// Without a delay the envelope goes straight back to the work queue;
    /// otherwise it waits in the delay queue until it expires and the broker
    /// moves it back.
    pub async fn requeue(&self, envelope: &TaskEnvelope, delay: Option<Duration>) -> AnvilResult<()> {
        let mut message = self.inner.outbound(envelope)?;
        let queue = match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                message.expiration = Some(delay);
                &self.inner.topology.delay.name
            }
            None => &self.inner.topology.work.name,
        };

        self.inner.send_confirmed(queue, message).await?;
        self.inner.retried.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Requeued task {} (attempt {}) with delay: {:?}",
            envelope.id,
            envelope.attempt_count,
            delay
        );
        Ok(())
    }

    /// Park raw message bytes in the dead-letter queue.
    ///
    /// The bytes are stored unchanged so undecodable messages survive for
    /// inspection.
    pub async fn dead_letter(&self, body: &[u8], reason: &str) -> AnvilResult<()> {
        let Some(dead_letter) = &self.inner.topology.dead_letter else {
            return Err(AnvilError::config("no dead-letter queue configured"));
        };

        let mut message = OutboundMessage::persistent(body.to_vec(), self.inner.codec.content_type());
        message.headers = vec![("x-death-reason".to_string(), reason.to_string())];

        self.inner.send_confirmed(&dead_letter.name, message).await?;
        self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Open a manual-ack subscription on the work queue.
    pub async fn subscribe(
        &self,
        consumer_tag: &str,
        prefetch: u16,
    ) -> AnvilResult<Box<dyn DeliveryStream>> {
        let connection = self.inner.connection()?;
        connection
            .consume(&self.inner.topology.work.name, consumer_tag, prefetch)
            .await
    }

    /// Ready messages in the work queue.
    pub async fn queue_depth(&self) -> AnvilResult<u64> {
        self.depth(&self.inner.topology.work.name).await
    }

    /// Ready messages in any queue of the topology.
    pub async fn depth(&self, queue: &str) -> AnvilResult<u64> {
        self.inner.connection()?.message_count(queue).await
    }

    /// Activity counters; `depth` is 0 while disconnected.
    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.queue_depth().await.unwrap_or(0),
            published: self.inner.published.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop reconnecting and close the connection.
    pub async fn close(&self) -> AnvilResult<()> {
        self.inner.shutdown.send_replace(true);

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let connection = self
            .inner
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.status.send_replace(ChannelStatus::Closed);

        if let Some(connection) = connection {
            connection.close().await?;
        }
        tracing::info!("Queue channel closed");
        Ok(())
    }
}

impl Drop for QueueChannel {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueChannel")
            .field("queue", &self.inner.topology.work.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Watches the connection and reconnects until shut down or failed.
async fn supervise(inner: Arc<ChannelInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Some(connection) = inner.current() {
            tokio::select! {
                _ = connection.closed() => {
                    inner.set_connection(None);
                    inner.status.send_replace(ChannelStatus::Disconnected);
                    tracing::warn!("Broker connection lost, reconnecting");
                    attempt = 0;
                }
                _ = shutdown.changed() => break,
            }
            continue;
        }

        attempt = attempt.saturating_add(1);
        let delay = calculate_backoff(
            attempt,
            inner.reconnect.base_delay_ms,
            inner.reconnect.max_delay_ms,
            inner.reconnect.enable_jitter,
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            _ = shutdown.changed() => break,
        }

        match inner.connect_once().await {
            Ok(connection) => {
                inner.set_connection(Some(connection));
                inner.reconnects.fetch_add(1, Ordering::Relaxed);
                inner.status.send_replace(ChannelStatus::Connected);
                tracing::info!("Reconnected to broker after {} attempt(s)", attempt);
                attempt = 0;
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("Giving up on broker: {}", e);
                let message = match e {
                    AnvilError::Fatal { message } => message,
                    other => other.to_string(),
                };
                inner.status.send_replace(ChannelStatus::Failed(message));
                break;
            }
            Err(e) => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }
    }
}
