//! Broker backends and the durable queue channel.
//!
//! anvilq does not implement queueing itself: it talks to a broker through a
//! small contract (durable queues, persistent messages, manual ack/nack with a
//! requeue flag, per-consumer prefetch, per-message expiry re-routed to another
//! queue). Two backends implement it:
//! - **AMQP** (`amqp` feature): RabbitMQ or any AMQP 0-9-1 broker via `lapin`
//! - **In-Memory**: a single-process broker with the same delivery semantics,
//!   used in tests and for running producer and workers inside one process
//!
//! [`QueueChannel`] sits on top of a backend and owns the connection lifecycle.
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> AnvilResult<()> {
//! let broker = InMemoryBroker::new();
//! let config = AnvilConfig::testing();
//! let channel = QueueChannel::open(Arc::new(broker.connector()), &config).await?;
//! channel.wait_connected().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfirmMode, QueueConfig};
use crate::error::AnvilResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod channel;
pub mod memory;

pub use channel::{ChannelStatus, QueueChannel};
pub use memory::{InMemoryBroker, InMemoryConnector};

#[cfg(feature = "amqp")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
pub mod amqp;

#[cfg(feature = "amqp")]
#[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
pub use amqp::AmqpConnector;

/// Declared shape of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Maximum ready messages; further publishes are rejected
    pub max_length: Option<u32>,
    /// Expired messages are re-routed to this queue
    pub dead_letter_to: Option<String>,
}

impl QueueSpec {
    /// A plain durable queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_length: None,
            dead_letter_to: None,
        }
    }
}

/// Every queue the channel declares before publishing or subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Main work queue
    pub work: QueueSpec,
    /// Retry delay queue; expired messages flow back to `work`
    pub delay: QueueSpec,
    /// Optional dead-letter queue
    pub dead_letter: Option<QueueSpec>,
}

impl Topology {
    /// Derive the topology from queue configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        let work = QueueSpec {
            name: config.name.clone(),
            durable: config.durable,
            max_length: config.max_length,
            dead_letter_to: None,
        };
        let delay = QueueSpec {
            name: config.delay_queue_name(),
            durable: config.durable,
            max_length: None,
            dead_letter_to: Some(config.name.clone()),
        };
        let dead_letter = config
            .dead_letter_queue
            .as_ref()
            .map(|name| QueueSpec::durable(name.clone()));

        Self {
            work,
            delay,
            dead_letter,
        }
    }

    /// All queues, declaration order.
    pub fn queues(&self) -> impl Iterator<Item = &QueueSpec> {
        [&self.work, &self.delay]
            .into_iter()
            .chain(self.dead_letter.as_ref())
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Encoded envelope
    pub body: Vec<u8>,
    /// MIME type of `body`
    pub content_type: &'static str,
    /// Task id, when known
    pub message_id: Option<String>,
    /// Persistent delivery mode (written to disk by the broker)
    pub persistent: bool,
    /// Message expires (and is dead-lettered by the queue) after this long
    pub expiration: Option<Duration>,
    /// Extra string headers
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// A persistent message with no expiry.
    pub fn persistent(body: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            body,
            content_type,
            message_id: None,
            persistent: true,
            expiration: None,
            headers: Vec::new(),
        }
    }
}

/// How far a publish got before `publish` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAck {
    /// The broker confirmed it owns the message
    Confirmed,
    /// The bytes were handed to the transport; nothing more is known
    Written,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Positive acknowledgment; the broker deletes the message
    async fn ack(&self) -> AnvilResult<()>;

    /// Negative acknowledgment; `requeue` puts the message back
    async fn nack(&self, requeue: bool) -> AnvilResult<()>;
}

/// One message lent to a consumer by the broker.
///
/// A delivery is completed only by calling [`Delivery::ack`] or
/// [`Delivery::nack`]. Dropping it leaves the message unacknowledged; the
/// broker redelivers it once the subscription goes away.
pub struct Delivery {
    /// Broker handle for this delivery
    pub delivery_tag: u64,
    /// The broker delivered this message before
    pub redelivered: bool,
    /// Raw message bytes
    pub body: Vec<u8>,
    acker: Arc<dyn DeliveryAcker>,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    /// Wrap a broker delivery.
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker: Arc::from(acker),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that can still return this delivery to the broker if
    /// whatever owns it unwinds before settling it.
    pub fn return_handle(&self) -> ReturnHandle {
        ReturnHandle {
            delivery_tag: self.delivery_tag,
            acker: self.acker.clone(),
            settled: self.settled.clone(),
        }
    }

    /// Acknowledge and complete the delivery.
    pub async fn ack(self) -> AnvilResult<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.acker.ack().await
    }

    /// Reject and complete the delivery.
    pub async fn nack(self, requeue: bool) -> AnvilResult<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.acker.nack(requeue).await
    }
}

/// Detached handle on a [`Delivery`], see [`Delivery::return_handle`].
pub struct ReturnHandle {
    delivery_tag: u64,
    acker: Arc<dyn DeliveryAcker>,
    settled: Arc<AtomicBool>,
}

impl ReturnHandle {
    /// Broker handle of the delivery.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Nack with requeue unless the delivery was already settled.
    ///
    /// Returns whether a nack was sent.
    pub async fn requeue_unsettled(self) -> AnvilResult<bool> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.acker.nack(true).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Deliveries for one subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the subscription is gone (cancelled or
    /// connection lost). Cancel-safe.
    async fn next_delivery(&mut self) -> Option<AnvilResult<Delivery>>;

    /// Stop receiving new deliveries.
    ///
    /// Deliveries already handed out stay settleable. Whatever is still
    /// unsettled goes back to the broker once the stream is dropped.
    async fn cancel(&mut self) -> AnvilResult<()>;
}

/// A live connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Create the queue if absent; fail if it exists with other settings.
    async fn declare(&self, spec: &QueueSpec) -> AnvilResult<()>;

    /// Publish `message` to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
        confirm: ConfirmMode,
    ) -> AnvilResult<PublishAck>;

    /// Open a manual-ack subscription on its own sub-channel.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> AnvilResult<Box<dyn DeliveryStream>>;

    /// Ready messages in `queue`.
    async fn message_count(&self, queue: &str) -> AnvilResult<u64>;

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    /// Close the connection.
    async fn close(&self) -> AnvilResult<()>;
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> AnvilResult<Arc<dyn BrokerConnection>>;

    /// Human-readable target, without credentials.
    fn describe(&self) -> String;
}

/// Snapshot of channel activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Ready messages in the work queue
    pub depth: u64,
    /// Envelopes published by producers
    pub published: u64,
    /// Envelopes republished for another attempt
    pub retried: u64,
    /// Envelopes moved to the dead-letter queue
    pub dead_lettered: u64,
    /// Successful reconnects after a connection loss
    pub reconnects: u64,
}
