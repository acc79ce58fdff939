//! The main Anvil facade.
//!
//! [`Anvil`] owns one queue channel and wires the producer side
//! ([`Submitter`]) and the consumer side ([`AnvilEngine`]) onto it. A process
//! may use either half or both.

use crate::config::AnvilConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::envelope::TaskId;
use crate::queue::{BrokerConnector, ChannelStatus, InMemoryBroker, QueueChannel, QueueStats};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod handler;
pub mod submitter;
pub mod worker;

pub use engine::AnvilEngine;
pub use handler::{AnvilTask, FnHandler, HandlerRegistry, PatternStats, TaskHandler};
pub use submitter::Submitter;
pub use worker::{Worker, WorkerManager, WorkerStats};

/// The main anvilq entry point.
///
/// # Examples
///
/// ```rust
/// use anvilq::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> AnvilResult<()> {
///     let broker = InMemoryBroker::new();
///     let registry = HandlerRegistry::new().with_fn("task_created", |envelope| async move {
///         tracing::info!("Received task: {:?}", envelope.description());
///         Ok(())
///     });
///
///     let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, registry).await?;
///     anvil.start_forging().await?;
///     anvil.submit(&serde_json::json!({ "description": "send email" })).await?;
///     anvil.stop_forging().await?;
///     anvil.close().await
/// }
/// ```
pub struct Anvil {
    config: AnvilConfig,
    channel: Arc<QueueChannel>,
    submitter: Submitter,
    registry: Arc<HandlerRegistry>,
    engine: Arc<RwLock<Option<AnvilEngine>>>,
    is_running: Arc<RwLock<bool>>,
}

impl Anvil {
    /// Validate `config`, connect through `connector` and declare the queues.
    ///
    /// An unreachable broker is not an error here; the channel keeps
    /// reconnecting in the background. Invalid configuration and fatal broker
    /// conditions are.
    pub async fn connect(
        config: AnvilConfig,
        connector: Arc<dyn BrokerConnector>,
        registry: HandlerRegistry,
    ) -> AnvilResult<Self> {
        config.ensure_valid()?;
        let channel = QueueChannel::open(connector, &config).await?;

        Ok(Self {
            submitter: Submitter::new(channel.clone()),
            config,
            channel,
            registry: Arc::new(registry),
            engine: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Create an Anvil talking AMQP to `config.broker.url`.
    #[cfg(feature = "amqp")]
    #[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
    pub async fn with_amqp(config: AnvilConfig, registry: HandlerRegistry) -> AnvilResult<Self> {
        let connector = crate::queue::AmqpConnector::from_config(&config.broker);
        Self::connect(config, Arc::new(connector), registry).await
    }

    /// Create an Anvil on an in-process broker.
    pub async fn in_memory(
        config: AnvilConfig,
        broker: &InMemoryBroker,
        registry: HandlerRegistry,
    ) -> AnvilResult<Self> {
        Self::connect(config, Arc::new(broker.connector()), registry).await
    }

    /// A cloneable producer handle sharing this Anvil's connection.
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    /// Submit a payload under the default pattern.
    pub async fn submit<P: Serialize + ?Sized>(&self, payload: &P) -> AnvilResult<TaskId> {
        self.submitter.submit(payload).await
    }

    /// Submit a payload under an explicit pattern.
    pub async fn submit_pattern<P: Serialize + ?Sized>(
        &self,
        pattern: &str,
        payload: &P,
    ) -> AnvilResult<TaskId> {
        self.submitter.submit_pattern(pattern, payload).await
    }

    /// Submit a typed task.
    pub async fn submit_task<T: AnvilTask>(&self, task: &T) -> AnvilResult<TaskId> {
        self.submitter.submit_task(task).await
    }

    /// Start the worker pool.
    ///
    /// Returns immediately; use [`Anvil::wait_for_shutdown`] to block.
    pub async fn start_forging(&self) -> AnvilResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(AnvilError::AlreadyRunning);
        }

        let mut engine_guard = self.engine.write().await;
        let mut engine = AnvilEngine::new(
            self.config.clone(),
            self.channel.clone(),
            self.registry.clone(),
        );

        engine.start().await?;
        *engine_guard = Some(engine);
        *is_running = true;

        tracing::info!(
            "Anvil started forging with {} workers on {}",
            self.config.workers.num_workers,
            self.channel.queue_name()
        );
        Ok(())
    }

    /// Stop the worker pool, draining in-flight deliveries.
    pub async fn stop_forging(&self) -> AnvilResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Err(AnvilError::NotRunning);
        }

        let mut engine_guard = self.engine.write().await;
        if let Some(engine) = engine_guard.take() {
            engine.shutdown().await?;
        }

        *is_running = false;
        tracing::info!("Anvil stopped forging");
        Ok(())
    }

    /// Stop the worker pool without draining.
    ///
    /// Unsettled deliveries return to the broker, exactly as if the process
    /// had crashed.
    pub async fn abort_forging(&self) -> AnvilResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Err(AnvilError::NotRunning);
        }

        let mut engine_guard = self.engine.write().await;
        if let Some(engine) = engine_guard.take() {
            engine.abort().await?;
        }

        *is_running = false;
        tracing::warn!("Anvil aborted forging");
        Ok(())
    }

    /// Check if the worker pool is running.
    pub async fn is_forging(&self) -> bool {
        *self.is_running.read().await
    }

    /// Block until Ctrl+C or a fatal error, then drain and stop the pool.
    pub async fn wait_for_shutdown(&self) -> AnvilResult<()> {
        let result = {
            let engine_guard = self.engine.read().await;
            match engine_guard.as_ref() {
                Some(engine) => engine.wait_for_shutdown().await,
                None => return Ok(()),
            }
        };

        let mut is_running = self.is_running.write().await;
        self.engine.write().await.take();
        *is_running = false;
        result
    }

    /// Queue depth and channel counters.
    pub async fn stats(&self) -> QueueStats {
        self.channel.stats().await
    }

    /// Worker statistics (if running).
    pub async fn worker_stats(&self) -> Option<WorkerStats> {
        let engine_guard = self.engine.read().await;
        match engine_guard.as_ref() {
            Some(engine) => Some(engine.worker_stats().await),
            None => None,
        }
    }

    /// Check the broker connection and, if running, the worker pool.
    pub async fn health_check(&self) -> AnvilResult<()> {
        if !self.channel.is_connected() {
            return match self.channel.status() {
                ChannelStatus::Failed(message) => Err(AnvilError::fatal(message)),
                _ => Err(AnvilError::NotConnected),
            };
        }

        let engine_guard = self.engine.read().await;
        if let Some(engine) = engine_guard.as_ref() {
            engine.health_check().await?;
        }

        Ok(())
    }

    /// The shared queue channel.
    pub fn channel(&self) -> &Arc<QueueChannel> {
        &self.channel
    }

    /// The registry workers dispatch to.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Get the configuration used by this Anvil.
    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }

    /// Stop the pool if needed and close the broker connection.
    pub async fn close(&self) -> AnvilResult<()> {
        if self.is_forging().await {
            self.stop_forging().await?;
        }
        self.channel.close().await
    }
}

impl Drop for Anvil {
    fn drop(&mut self) {
        let running = self.is_running.try_read().map(|r| *r).unwrap_or(true);
        if running {
            tracing::warn!(
                "Anvil dropped while still running. Call stop_forging() explicitly for graceful shutdown."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EnvelopeCodec, JsonCodec};
    use crate::envelope::{DEFAULT_PATTERN, TaskEnvelope};
    use crate::queue::QueueSpec;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(10), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn dead_letters(broker: &InMemoryBroker) -> Vec<TaskEnvelope> {
        broker
            .peek("task_queue.dead")
            .iter()
            .map(|body| JsonCodec.decode(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_anvil_lifecycle() {
        let broker = InMemoryBroker::new();
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, HandlerRegistry::new())
            .await
            .unwrap();

        // Should not be running initially
        assert!(!anvil.is_forging().await);
        assert!(anvil.worker_stats().await.is_none());
        assert!(matches!(anvil.stop_forging().await, Err(AnvilError::NotRunning)));

        // Start forging
        anvil.start_forging().await.unwrap();
        assert!(anvil.is_forging().await);
        assert!(anvil.worker_stats().await.is_some());

        // Should fail to start again
        assert!(matches!(anvil.start_forging().await, Err(AnvilError::AlreadyRunning)));

        // Stop forging
        anvil.stop_forging().await.unwrap();
        assert!(!anvil.is_forging().await);
        anvil.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let broker = InMemoryBroker::new();
        let mut config = AnvilConfig::testing();
        config.queue.durable = false;

        let result = Anvil::in_memory(config, &broker, HandlerRegistry::new()).await;
        assert!(matches!(result, Err(AnvilError::ConfigError { .. })));
        assert!(!broker.has_queue("task_queue"));
    }

    #[tokio::test]
    async fn test_send_email_is_processed_and_acked() {
        let broker = InMemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |envelope| {
            let record = record.clone();
            async move {
                record
                    .lock()
                    .unwrap()
                    .push(envelope.description().map(str::to_string));
                Ok(())
            }
        });
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, registry)
            .await
            .unwrap();

        anvil.start_forging().await.unwrap();
        anvil
            .submit(&json!({ "description": "send-email" }))
            .await
            .unwrap();

        eventually(|| seen.lock().unwrap().len() == 1).await;
        anvil.stop_forging().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![Some("send-email".to_string())]);
        assert_eq!(broker.depth("task_queue"), 0);
        assert_eq!(broker.unacked("task_queue"), 0);
        assert!(dead_letters(&broker).is_empty());
    }

    #[tokio::test]
    async fn test_always_transient_goes_through_delay_queue_then_dead_letters() {
        let broker = InMemoryBroker::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let record = attempts.clone();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |envelope| {
            let record = record.clone();
            async move {
                record.lock().unwrap().push(envelope.attempt_count);
                Err(AnvilError::transient("smtp unavailable"))
            }
        });
        let mut config = AnvilConfig::testing();
        config.retry = RetryPolicy::fixed(3, 20);
        let anvil = Anvil::in_memory(config, &broker, registry).await.unwrap();

        anvil.start_forging().await.unwrap();
        let id = anvil.submit(&json!({ "description": "flaky" })).await.unwrap();

        eventually(|| broker.depth("task_queue.dead") == 1).await;
        anvil.stop_forging().await.unwrap();

        assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 3]);
        let parked = dead_letters(&broker);
        assert_eq!(parked[0].id, id);
        assert_eq!(parked[0].attempt_count, 3);
        assert_eq!(broker.depth("task_queue"), 0);
        assert_eq!(broker.depth("task_queue.retry"), 0);

        let stats = anvil.stats().await;
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let broker = InMemoryBroker::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AnvilError::permanent("malformed address")) }
        });
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, registry)
            .await
            .unwrap();

        anvil.start_forging().await.unwrap();
        anvil.submit(&json!({ "to": "nowhere" })).await.unwrap();

        eventually(|| broker.depth("task_queue.dead") == 1).await;
        anvil.stop_forging().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dead_letters(&broker)[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_pattern_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, HandlerRegistry::new())
            .await
            .unwrap();

        anvil.start_forging().await.unwrap();
        anvil
            .submit_pattern("nobody_listens", &json!({}))
            .await
            .unwrap();

        eventually(|| broker.depth("task_queue.dead") == 1).await;
        anvil.stop_forging().await.unwrap();
        assert_eq!(dead_letters(&broker)[0].pattern, "nobody_listens");
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let broker = InMemoryBroker::new();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, |envelope| async move {
            if envelope.attempt_count == 0 {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        });
        let mut config = AnvilConfig::testing();
        config.workers.task_timeout_secs = 1;
        let anvil = Anvil::in_memory(config, &broker, registry).await.unwrap();

        anvil.start_forging().await.unwrap();
        anvil.submit(&json!({})).await.unwrap();

        eventually(|| broker.depth("task_queue") == 0 && broker.unacked("task_queue") == 0)
            .await;
        let stats = timeout(Duration::from_secs(5), async {
            loop {
                let stats = anvil.worker_stats().await.unwrap_or_default();
                if stats.tasks_completed == 1 {
                    return stats;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        anvil.stop_forging().await.unwrap();

        assert_eq!(stats.tasks_retried, 1);
        assert!(dead_letters(&broker).is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_bounds_concurrency() {
        let broker = InMemoryBroker::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (c, p, d) = (current.clone(), peak.clone(), done.clone());
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |_| {
            let (c, p, d) = (c.clone(), p.clone(), d.clone());
            async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                c.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let mut config = AnvilConfig::testing();
        config.workers.prefetch_count = 2;
        let anvil = Anvil::in_memory(config, &broker, registry).await.unwrap();

        for n in 0..8 {
            anvil.submit(&json!({ "n": n })).await.unwrap();
        }
        anvil.start_forging().await.unwrap();

        eventually(|| broker.unacked("task_queue") > 0).await;
        assert!(broker.unacked("task_queue") <= 2);

        eventually(|| done.load(Ordering::SeqCst) == 8).await;
        anvil.stop_forging().await.unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
    }

    #[tokio::test]
    async fn test_killed_worker_task_is_redelivered() {
        let broker = InMemoryBroker::new();
        let started = Arc::new(AtomicU32::new(0));
        let counter = started.clone();
        let stuck = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        });
        let first = Anvil::in_memory(AnvilConfig::testing(), &broker, stuck)
            .await
            .unwrap();
        first.start_forging().await.unwrap();
        let id = first.submit(&json!({ "description": "resize" })).await.unwrap();

        eventually(|| started.load(Ordering::SeqCst) == 1).await;
        first.abort_forging().await.unwrap();
        assert_eq!(broker.depth("task_queue"), 1);

        let finished = Arc::new(Mutex::new(None));
        let record = finished.clone();
        let healthy = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |envelope| {
            *record.lock().unwrap() = Some(envelope);
            async { Ok(()) }
        });
        let second = Anvil::in_memory(AnvilConfig::testing(), &broker, healthy)
            .await
            .unwrap();
        second.start_forging().await.unwrap();

        eventually(|| finished.lock().unwrap().is_some()).await;
        second.stop_forging().await.unwrap();

        let envelope = finished.lock().unwrap().take().unwrap();
        assert_eq!(envelope.id, id);
        // The interrupted run counts as attempt 0
        assert_eq!(envelope.attempt_count, 1);
        assert_eq!(broker.depth("task_queue"), 0);
        assert_eq!(broker.unacked("task_queue"), 0);
    }

    #[tokio::test]
    async fn test_broker_outage_is_visible_then_recovers() {
        let broker = InMemoryBroker::new();
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, HandlerRegistry::new())
            .await
            .unwrap();
        anvil.health_check().await.unwrap();

        broker.set_offline(true);
        assert!(matches!(
            anvil.submit(&json!({})).await,
            Err(AnvilError::NotConnected)
        ));
        assert!(anvil.health_check().await.is_err());

        broker.set_offline(false);
        timeout(Duration::from_secs(2), anvil.channel().wait_connected())
            .await
            .unwrap()
            .unwrap();
        anvil.submit(&json!({})).await.unwrap();
        assert_eq!(broker.depth("task_queue"), 1);
        assert!(anvil.stats().await.reconnects >= 1);
    }

    #[tokio::test]
    async fn test_declare_mismatch_is_fatal() {
        let broker = InMemoryBroker::new();
        let connection = broker.connector().connect().await.unwrap();
        let mut conflicting = QueueSpec::durable("task_queue");
        conflicting.max_length = Some(10);
        connection.declare(&conflicting).await.unwrap();

        let result = Anvil::in_memory(AnvilConfig::testing(), &broker, HandlerRegistry::new()).await;
        match result {
            Err(e) => assert!(e.is_fatal(), "unexpected error: {}", e),
            Ok(_) => panic!("declare mismatch accepted"),
        }
    }

    #[tokio::test]
    async fn test_registry_is_shared_with_workers() {
        let broker = InMemoryBroker::new();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, |_| async { Ok(()) });
        let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, registry)
            .await
            .unwrap();

        anvil.start_forging().await.unwrap();
        anvil.submit(&json!({})).await.unwrap();

        let registry = anvil.registry().clone();
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(stats) = registry.pattern_stats(DEFAULT_PATTERN).await {
                    if stats.succeeded == 1 {
                        break;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        anvil.close().await.unwrap();
        assert!(!anvil.is_forging().await);
    }
}
