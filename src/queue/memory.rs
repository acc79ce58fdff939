//! In-memory broker for anvilq.
//!
//! A single-process stand-in for an AMQP broker. It keeps the delivery
//! semantics the worker pool relies on, so the same code paths run against it
//! and against RabbitMQ:
//!
//! - **Manual acks**: deliveries stay unacknowledged until acked or nacked
//! - **Prefetch**: a consumer never holds more than its prefetch limit
//! - **Redelivery**: unacked deliveries go back to the head of the queue when
//!   their consumer is dropped or their connection goes away, flagged as
//!   redelivered. Cancelling only stops new deliveries.
//! - **Expiry re-routing**: expired messages move to the queue's dead-letter target
//! - **Durability**: [`InMemoryBroker::restart`] keeps durable queues and their
//!   persistent messages, and drops everything else
//!
//! Clones share the same broker state.

use super::{
    BrokerConnection, BrokerConnector, Delivery, DeliveryAcker, DeliveryStream, OutboundMessage,
    PublishAck, QueueSpec,
};
use crate::config::ConfirmMode;
use crate::error::{AnvilError, AnvilResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    consumer_id: u64,
    connection_id: u64,
    message: StoredMessage,
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    /// Put matching unacked deliveries back at the head, oldest first.
    fn return_unacked(&mut self, matches: impl Fn(&Unacked) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| matches(unacked))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.iter().rev() {
            if let Some(unacked) = self.unacked.remove(tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        tags.len()
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<u64, watch::Sender<bool>>,
    next_id: u64,
    offline: bool,
}

impl BrokerInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn return_unacked(&mut self, matches: impl Fn(&Unacked) -> bool) -> usize {
        self.queues
            .values_mut()
            .map(|queue| queue.return_unacked(&matches))
            .sum()
    }
}

#[derive(Debug)]
struct BrokerShared {
    inner: Mutex<BrokerInner>,
    changes: watch::Sender<u64>,
}

/// In-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(BrokerShared {
                inner: Mutex::new(BrokerInner::default()),
                changes,
            }),
        }
    }

    /// A connector handing out connections to this broker.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.shared
            .changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Ready messages in `queue` (0 if it doesn't exist).
    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled messages in `queue`.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether `queue` has been declared.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Delete `queue` and everything in it, as `queue.delete` would.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let removed = self.lock().queues.remove(queue).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drop every client connection, as a network partition would.
    pub fn disconnect_all(&self) {
        {
            let mut inner = self.lock();
            for (_, lost) in inner.connections.drain() {
                lost.send_replace(true);
            }
            let returned = inner.return_unacked(|_| true);
            tracing::debug!("In-memory broker dropped all connections, {} deliveries returned", returned);
        }
        self.notify();
    }

    /// Refuse (or accept again) new connections.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
        if offline {
            self.disconnect_all();
        }
    }

    /// Simulate a broker restart: connections drop, non-durable queues and
    /// transient messages are lost, durable queues keep persistent messages.
    pub fn restart(&self) {
        self.disconnect_all();
        {
            let mut inner = self.lock();
            inner.queues.retain(|_, queue| queue.spec.durable);
            for queue in inner.queues.values_mut() {
                queue.ready.retain(|message| message.persistent);
            }
        }
        self.notify();
    }

    fn disconnect(&self, connection_id: u64) {
        {
            let mut inner = self.lock();
            if let Some(lost) = inner.connections.remove(&connection_id) {
                lost.send_replace(true);
            }
            inner.return_unacked(|unacked| unacked.connection_id == connection_id);
        }
        self.notify();
    }

    fn cancel_consumer(&self, consumer_id: u64) {
        let returned = self
            .lock()
            .return_unacked(|unacked| unacked.consumer_id == consumer_id);
        if returned > 0 {
            self.notify();
        }
    }

    fn expire(&self, queue: &str, message_id: u64) {
        {
            let mut inner = self.lock();
            let Some(source) = inner.queues.get_mut(queue) else {
                return;
            };
            let Some(position) = source.ready.iter().position(|m| m.id == message_id) else {
                return;
            };
            let Some(mut message) = source.ready.remove(position) else {
                return;
            };
            let target = source.spec.dead_letter_to.clone();

            match target.and_then(|name| inner.queues.get_mut(&name)) {
                Some(target) => {
                    message.redelivered = false;
                    target.ready.push_back(message);
                }
                None => tracing::debug!("Expired message {} dropped from {}", message_id, queue),
            }
        }
        self.notify();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> AnvilResult<Arc<dyn BrokerConnection>> {
        let mut inner = self.broker.lock();
        if inner.offline {
            return Err(AnvilError::disconnected("in-memory broker is offline"));
        }

        let id = inner.next_id();
        let (lost_tx, lost_rx) = watch::channel(false);
        inner.connections.insert(id, lost_tx);

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            lost: lost_rx,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    lost: watch::Receiver<bool>,
}

impl MemoryConnection {
    fn ensure_alive(&self) -> AnvilResult<()> {
        if *self.lost.borrow() {
            Err(AnvilError::disconnected("connection closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare(&self, spec: &QueueSpec) -> AnvilResult<()> {
        self.ensure_alive()?;
        let mut inner = self.broker.lock();

        match inner.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(AnvilError::fatal(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                inner
                    .queues
                    .insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        message: OutboundMessage,
        confirm: ConfirmMode,
    ) -> AnvilResult<PublishAck> {
        self.ensure_alive()?;

        let ack = match confirm {
            ConfirmMode::BrokerConfirm => PublishAck::Confirmed,
            ConfirmMode::TransportOnly => PublishAck::Written,
        };

        let stored_id = {
            let mut inner = self.broker.lock();
            let id = inner.next_id();
            let Some(target) = inner.queues.get_mut(queue) else {
                return Err(AnvilError::rejected(format!("NOT_FOUND - no queue '{}'", queue)));
            };

            if let Some(max_length) = target.spec.max_length {
                if target.ready.len() >= max_length as usize {
                    return match confirm {
                        ConfirmMode::BrokerConfirm => Err(AnvilError::rejected(format!(
                            "queue '{}' is full (max length {})",
                            queue, max_length
                        ))),
                        ConfirmMode::TransportOnly => {
                            tracing::warn!("Queue {} is full, unconfirmed publish dropped", queue);
                            Ok(ack)
                        }
                    };
                }
            }

            target.ready.push_back(StoredMessage {
                id,
                body: message.body,
                persistent: message.persistent,
                redelivered: false,
            });
            id
        };

        if let Some(expiration) = message.expiration {
            let broker = self.broker.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(expiration).await;
                broker.expire(&queue, stored_id);
            });
        }

        self.broker.notify();
        Ok(ack)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch: u16,
    ) -> AnvilResult<Box<dyn DeliveryStream>> {
        self.ensure_alive()?;
        let consumer_id = {
            let mut inner = self.broker.lock();
            if !inner.queues.contains_key(queue) {
                return Err(AnvilError::fatal(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            inner.next_id()
        };

        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            connection_id: self.id,
            consumer_id,
            queue: queue.to_string(),
            prefetch: prefetch.max(1) as usize,
            lost: self.lost.clone(),
            changes: self.broker.shared.changes.subscribe(),
            cancelled: false,
        }))
    }

    async fn message_count(&self, queue: &str) -> AnvilResult<u64> {
        self.ensure_alive()?;
        self.broker
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| AnvilError::fatal(format!("NOT_FOUND - no queue '{}'", queue)))
    }

    fn is_connected(&self) -> bool {
        !*self.lost.borrow()
    }

    async fn closed(&self) {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> AnvilResult<()> {
        self.broker.disconnect(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
    }
}

struct MemoryConsumer {
    broker: InMemoryBroker,
    connection_id: u64,
    consumer_id: u64,
    queue: String,
    prefetch: usize,
    lost: watch::Receiver<bool>,
    changes: watch::Receiver<u64>,
    cancelled: bool,
}

impl MemoryConsumer {
    fn try_take(&self) -> Option<AnvilResult<Delivery>> {
        let mut inner = self.broker.lock();
        let tag = inner.next_id();
        let Some(queue) = inner.queues.get_mut(&self.queue) else {
            return Some(Err(AnvilError::disconnected(format!(
                "queue '{}' no longer exists",
                self.queue
            ))));
        };

        let held = queue
            .unacked
            .values()
            .filter(|unacked| unacked.consumer_id == self.consumer_id)
            .count();
        if held >= self.prefetch {
            return None;
        }

        let message = queue.ready.pop_front()?;
        let delivery = Delivery::new(
            tag,
            message.redelivered,
            message.body.clone(),
            Box::new(MemoryAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                tag,
            }),
        );
        queue.unacked.insert(
            tag,
            Unacked {
                consumer_id: self.consumer_id,
                connection_id: self.connection_id,
                message,
            },
        );
        Some(Ok(delivery))
    }
}

#[async_trait]
impl DeliveryStream for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<AnvilResult<Delivery>> {
        loop {
            self.changes.borrow_and_update();
            if self.cancelled || *self.lost.borrow() {
                return None;
            }

            if let Some(result) = self.try_take() {
                return Some(result);
            }

            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn cancel(&mut self) -> AnvilResult<()> {
        self.cancelled = true;
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.broker.cancel_consumer(self.consumer_id);
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> AnvilResult<()> {
        {
            let mut inner = self.broker.lock();
            let unacked = inner
                .queues
                .get_mut(&self.queue)
                .and_then(|queue| queue.unacked.remove(&self.tag).map(|u| (queue, u)));

            match unacked {
                Some((queue, unacked)) if requeue => {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                Some(_) => {}
                None => {
                    return Err(AnvilError::disconnected(format!(
                        "unknown delivery tag {} on '{}'",
                        self.tag, self.queue
                    )));
                }
            }
        }
        self.broker.notify();
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> AnvilResult<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> AnvilResult<()> {
        self.settle(requeue)
    }
}
