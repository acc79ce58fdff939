//! Worker implementation for anvilq.
//!
//! Workers are the individual "blacksmiths" that forge (execute) tasks. Each
//! worker owns one subscription on the work queue and processes up to
//! `prefetch_count` deliveries at a time. Every delivery goes through the
//! same state machine:
//!
//! ```text
//! Delivered -> Processing -> Acked
//!                         -> NackedRequeue  (next attempt published, original acked)
//!                         -> NackedDiscard  (dead-lettered and acked, or rejected)
//! ```
//!
//! A delivery is acked only after its handler succeeded or after its next
//! destination (retry copy, dead-letter queue) has been confirmed by the
//! broker. Anything else leaves it with the broker for redelivery, and a
//! redelivered message counts its interrupted run as an attempt.

use crate::codec::EnvelopeCodec;
use crate::config::WorkerConfig;
use crate::core::handler::{HandlerRegistry, TaskHandler, failure_kind};
use crate::envelope::{DeliveryOutcome, TaskEnvelope};
use crate::error::AnvilError;
use crate::queue::{Delivery, DeliveryStream, QueueChannel};
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::utils::calculate_backoff;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};

/// Reasons why a worker might die
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDeathCause {
    /// Normal shutdown
    Normal,
    /// Unrecoverable broker condition; restarting would not help
    Fatal(String),
    /// Worker panicked
    Panic,
}

/// Information about a dead worker
#[derive(Debug, Clone)]
pub struct DeadWorker {
    /// Worker identifier
    pub worker_id: usize,
    /// Why the worker died
    pub cause: WorkerDeathCause,
    /// When the worker died
    pub died_at: SystemTime,
}

/// Statistics about worker performance
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Number of active workers
    pub active_workers: usize,
    /// Total number of workers spawned
    pub total_workers: usize,
    /// Deliveries currently being processed
    pub in_flight: usize,
    /// Tasks whose handler succeeded
    pub tasks_completed: u64,
    /// Tasks sent back for another attempt
    pub tasks_retried: u64,
    /// Tasks moved to the dead-letter queue
    pub tasks_dead_lettered: u64,
    /// Tasks rejected without a dead-letter queue
    pub tasks_discarded: u64,
    /// Deliveries left unsettled for the broker to redeliver
    pub tasks_abandoned: u64,
    /// Number of worker restarts
    pub worker_restarts: u64,
    /// Average delivery processing time
    pub avg_task_duration: Option<Duration>,
}

/// How a subscription session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

/// Aborts the wrapped task when dropped, so a timed out or abandoned
/// delivery never leaves its handler running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => describe_panic(payload.as_ref()),
        Err(error) => error.to_string(),
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs single deliveries through the state machine.
struct DeliveryProcessor {
    worker_id: usize,
    channel: Arc<QueueChannel>,
    codec: Arc<dyn EnvelopeCodec>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    task_timeout: Duration,
}

impl DeliveryProcessor {
    async fn process(self: Arc<Self>, delivery: Delivery) -> (DeliveryOutcome, Duration) {
        let started = Instant::now();
        let handle = delivery.return_handle();

        let outcome = match AssertUnwindSafe(self.settle(delivery)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                tracing::error!(
                    "🔨 Worker {} panicked on delivery {}: {}",
                    self.worker_id,
                    handle.delivery_tag(),
                    describe_panic(payload.as_ref())
                );
                if let Err(e) = handle.requeue_unsettled().await {
                    tracing::debug!("🔨 Could not return delivery to the broker: {}", e);
                }
                DeliveryOutcome::Abandoned
            }
        };
        (outcome, started.elapsed())
    }

    async fn settle(&self, delivery: Delivery) -> DeliveryOutcome {
        let envelope = match self.codec.decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    "🔨 Worker {} received undecodable delivery {}: {}",
                    self.worker_id,
                    delivery.delivery_tag,
                    e
                );
                return self.discard(delivery, None, &FailureKind::Decode).await;
            }
        };

        if delivery.redelivered {
            return self.resume(delivery, envelope).await;
        }
        self.dispatch(delivery, envelope).await
    }

    /// A redelivered message was handed out before and never settled: its
    /// worker crashed, hung or lost the connection mid-attempt. That attempt
    /// counts, so the advanced envelope is republished and the original
    /// acked. If the republish fails the advanced envelope runs in place.
    async fn resume(&self, delivery: Delivery, envelope: TaskEnvelope) -> DeliveryOutcome {
        let interrupted = FailureKind::Transient("delivery interrupted".to_string());
        let delay = match self.retry.decide(envelope.attempt_count, &interrupted) {
            RetryDecision::Discard => {
                tracing::warn!(
                    "🔨 Task {} was interrupted on its last attempt {}",
                    envelope.id,
                    envelope.attempt_count
                );
                return self.discard(delivery, Some(&envelope), &interrupted).await;
            }
            RetryDecision::Requeue => None,
            RetryDecision::RequeueWithDelay(delay) => Some(delay),
        };

        let next = envelope.next_attempt();
        match self.channel.requeue(&next, delay).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    tracing::warn!(
                        "🔨 Task {} requeued but the redelivered original could not be acked: {}",
                        envelope.id,
                        e
                    );
                }
                tracing::warn!(
                    "🔨 Task {} was interrupted, requeued for attempt {}",
                    envelope.id,
                    next.attempt_count
                );
                DeliveryOutcome::Requeued
            }
            Err(e) => {
                tracing::warn!(
                    "🔨 Could not republish interrupted task {}, forging attempt {} in place: {}",
                    envelope.id,
                    next.attempt_count,
                    e
                );
                self.dispatch(delivery, next).await
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, envelope: TaskEnvelope) -> DeliveryOutcome {
        let Some(handler) = self.registry.get(&envelope.pattern) else {
            let failure = FailureKind::UnknownPattern(envelope.pattern.clone());
            return self.fail(delivery, &envelope, failure).await;
        };

        tracing::info!(
            "🔨 Worker {} forging task {} (attempt {})",
            self.worker_id,
            envelope.id,
            envelope.attempt_count
        );

        let started = Instant::now();
        let result = self.execute(handler, envelope.clone()).await;
        let duration = started.elapsed();
        self.registry.record(&envelope.pattern, &result, duration).await;

        match result {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    tracing::info!(
                        "🔨 Worker {} completed task {} in {:?}",
                        self.worker_id,
                        envelope.id,
                        duration
                    );
                    DeliveryOutcome::Acked
                }
                Err(e) => {
                    tracing::warn!(
                        "🔨 Worker {} could not ack task {}, broker will redeliver: {}",
                        self.worker_id,
                        envelope.id,
                        e
                    );
                    DeliveryOutcome::Abandoned
                }
            },
            Err(failure) => self.fail(delivery, &envelope, failure).await,
        }
    }

    /// Run the handler on its own task, bounded by the task timeout.
    async fn execute(
        &self,
        handler: Arc<dyn TaskHandler>,
        envelope: TaskEnvelope,
    ) -> Result<(), FailureKind> {
        let task_id = envelope.id.clone();
        let mut handle = AbortOnDrop(tokio::spawn(async move { handler.handle(envelope).await }));

        match timeout(self.task_timeout, &mut handle.0).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => {
                tracing::warn!("🔨 Task {} failed: {}", task_id, error);
                Err(failure_kind(&error))
            }
            Ok(Err(join_error)) => {
                let message = panic_message(join_error);
                tracing::error!("🔨 Task {} panicked: {}", task_id, message);
                Err(FailureKind::Programming(message))
            }
            Err(_) => {
                tracing::error!(
                    "🔨 Task {} timed out after {:?}",
                    task_id,
                    self.task_timeout
                );
                Err(FailureKind::Timeout)
            }
        }
    }

    /// Apply the retry policy to a failed attempt.
    async fn fail(
        &self,
        delivery: Delivery,
        envelope: &TaskEnvelope,
        failure: FailureKind,
    ) -> DeliveryOutcome {
        match self.retry.decide(envelope.attempt_count, &failure) {
            RetryDecision::Requeue => self.requeue(delivery, envelope, None).await,
            RetryDecision::RequeueWithDelay(delay) => {
                self.requeue(delivery, envelope, Some(delay)).await
            }
            RetryDecision::Discard => self.discard(delivery, Some(envelope), &failure).await,
        }
    }

    async fn requeue(
        &self,
        delivery: Delivery,
        envelope: &TaskEnvelope,
        delay: Option<Duration>,
    ) -> DeliveryOutcome {
        let next = envelope.next_attempt();
        if let Err(e) = self.channel.requeue(&next, delay).await {
            tracing::warn!(
                "🔨 Could not republish task {}, returning it to the broker: {}",
                envelope.id,
                e
            );
            return self.abandon(delivery, &envelope.id).await;
        }

        if let Err(e) = delivery.ack().await {
            tracing::warn!(
                "🔨 Task {} requeued but the original could not be acked, it may run twice: {}",
                envelope.id,
                e
            );
        }
        tracing::warn!(
            "🔨 Task {} requeued for attempt {} (delay: {:?})",
            envelope.id,
            next.attempt_count,
            delay
        );
        DeliveryOutcome::Requeued
    }

    async fn discard(
        &self,
        delivery: Delivery,
        envelope: Option<&TaskEnvelope>,
        failure: &FailureKind,
    ) -> DeliveryOutcome {
        let task = envelope
            .map(|e| e.id.clone())
            .unwrap_or_else(|| format!("<delivery {}>", delivery.delivery_tag));
        let attempts = envelope.map_or(0, |e| e.attempt_count);

        if !self.channel.has_dead_letter_queue() {
            tracing::error!(
                "🔨 Dropping task {} after attempt {}: {:?}",
                task,
                attempts,
                failure
            );
            return match delivery.nack(false).await {
                Ok(()) => DeliveryOutcome::Discarded,
                Err(e) => {
                    tracing::warn!("🔨 Could not reject task {}: {}", task, e);
                    DeliveryOutcome::Abandoned
                }
            };
        }

        let reason = format!("{:?}", failure);
        if let Err(e) = self.channel.dead_letter(&delivery.body, &reason).await {
            tracing::warn!(
                "🔨 Could not dead-letter task {}, returning it to the broker: {}",
                task,
                e
            );
            return self.abandon(delivery, &task).await;
        }

        if let Err(e) = delivery.ack().await {
            tracing::warn!(
                "🔨 Task {} dead-lettered but the original could not be acked: {}",
                task,
                e
            );
        }
        tracing::error!(
            "🔨 Task {} moved to dead-letter queue after attempt {}: {:?}",
            task,
            attempts,
            failure
        );
        DeliveryOutcome::DeadLettered
    }

    /// Hand the delivery back to the broker untouched.
    async fn abandon(&self, delivery: Delivery, task: &str) -> DeliveryOutcome {
        if let Err(e) = delivery.nack(true).await {
            tracing::debug!("🔨 Nack of task {} failed, broker will redeliver: {}", task, e);
        }
        DeliveryOutcome::Abandoned
    }
}

/// Individual worker that processes tasks
pub struct Worker {
    id: usize,
    config: WorkerConfig,
    channel: Arc<QueueChannel>,
    processor: Arc<DeliveryProcessor>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    /// Create a new worker with the given ID
    pub fn new(
        id: usize,
        config: WorkerConfig,
        retry: RetryPolicy,
        channel: Arc<QueueChannel>,
        registry: Arc<HandlerRegistry>,
        stats: Arc<Mutex<WorkerStats>>,
    ) -> Self {
        let processor = Arc::new(DeliveryProcessor {
            worker_id: id,
            codec: channel.codec(),
            channel: channel.clone(),
            registry,
            retry,
            task_timeout: config.task_timeout(),
        });

        Self {
            id,
            config,
            channel,
            processor,
            stats,
        }
    }

    /// Run the worker loop until shutdown or a fatal error
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerDeathCause {
        tracing::info!("🔨 Worker {} starting forge", self.id);

        let mut failed_subscribes = 0u32;
        let death_cause = loop {
            if *shutdown.borrow() {
                break WorkerDeathCause::Normal;
            }

            tokio::select! {
                connected = self.channel.wait_connected() => match connected {
                    Ok(()) => {}
                    Err(AnvilError::Fatal { message }) => break WorkerDeathCause::Fatal(message),
                    Err(_) => break WorkerDeathCause::Normal,
                },
                _ = shutdown.changed() => break WorkerDeathCause::Normal,
            }

            let consumer_tag = format!("anvilq-{}-{}", self.id, uuid::Uuid::new_v4());
            let stream = match self
                .channel
                .subscribe(&consumer_tag, self.config.prefetch_count)
                .await
            {
                Ok(stream) => stream,
                Err(AnvilError::Fatal { message }) => break WorkerDeathCause::Fatal(message),
                Err(e) => {
                    failed_subscribes = failed_subscribes.saturating_add(1);
                    let backoff_ms = calculate_backoff(
                        failed_subscribes,
                        self.config.restart_delay_ms,
                        30_000,
                        true,
                    );
                    tracing::warn!(
                        "🔨 Worker {} could not subscribe, backing off {}ms: {}",
                        self.id,
                        backoff_ms,
                        e
                    );
                    tokio::select! {
                        _ = sleep(Duration::from_millis(backoff_ms)) => continue,
                        _ = shutdown.changed() => break WorkerDeathCause::Normal,
                    }
                }
            };
            failed_subscribes = 0;

            tracing::debug!("🔨 Worker {} subscribed as {}", self.id, consumer_tag);
            match self.consume(stream, &mut shutdown).await {
                SessionEnd::Shutdown => break WorkerDeathCause::Normal,
                SessionEnd::Lost => {
                    tracing::warn!("🔨 Worker {} lost its subscription, resubscribing", self.id);
                }
            }
        };

        tracing::info!(
            "🔨 Worker {} finished with cause: {:?}",
            self.id,
            death_cause
        );
        death_cause
    }

    /// Pull deliveries until shutdown or until the subscription goes away,
    /// then cancel the subscription and drain what is in flight.
    async fn consume(
        &self,
        mut stream: Box<dyn DeliveryStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut in_flight: JoinSet<(DeliveryOutcome, Duration)> = JoinSet::new();

        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.record(joined).await;
                }
                next = stream.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        tracing::debug!(
                            "🔨 Worker {} received delivery {}",
                            self.id,
                            delivery.delivery_tag
                        );
                        in_flight.spawn(self.processor.clone().process(delivery));
                        self.stats.lock().await.in_flight += 1;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("🔨 Worker {} subscription failed: {}", self.id, e);
                        break SessionEnd::Lost;
                    }
                    None => break SessionEnd::Lost,
                },
            }
        };

        if let Err(e) = stream.cancel().await {
            tracing::debug!("🔨 Worker {} cancel failed: {}", self.id, e);
        }

        if end == SessionEnd::Shutdown && !in_flight.is_empty() {
            tracing::info!(
                "🔨 Worker {} draining {} in-flight deliveries",
                self.id,
                in_flight.len()
            );
        }

        let drain_timeout = self.config.shutdown_timeout();
        let drained = timeout(drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                self.record(joined).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "🔨 Worker {} abandoning {} deliveries after {:?}",
                self.id,
                in_flight.len(),
                drain_timeout
            );
            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                self.record(joined).await;
            }
        }

        // Unsettled deliveries go back to the broker with the subscription
        drop(stream);
        end
    }

    /// Update worker statistics
    async fn record(&self, joined: Result<(DeliveryOutcome, Duration), JoinError>) {
        let mut stats = self.stats.lock().await;
        stats.in_flight = stats.in_flight.saturating_sub(1);

        let (outcome, duration) = match joined {
            Ok(processed) => processed,
            Err(e) if e.is_cancelled() => {
                stats.tasks_abandoned += 1;
                return;
            }
            Err(e) => {
                tracing::error!("🔨 Worker {} delivery processing panicked: {}", self.id, e);
                stats.tasks_abandoned += 1;
                return;
            }
        };

        match outcome {
            DeliveryOutcome::Acked => stats.tasks_completed += 1,
            DeliveryOutcome::Requeued => stats.tasks_retried += 1,
            DeliveryOutcome::DeadLettered => stats.tasks_dead_lettered += 1,
            DeliveryOutcome::Discarded => stats.tasks_discarded += 1,
            DeliveryOutcome::Abandoned => stats.tasks_abandoned += 1,
        }

        // Update average duration (simple moving average)
        stats.avg_task_duration = Some(match stats.avg_task_duration {
            Some(avg) => (avg + duration) / 2,
            None => duration,
        });
    }
}

/// Manages the worker pool
#[derive(Clone)]
pub struct WorkerManager {
    /// Number of currently active workers
    pub active_workers: Arc<AtomicUsize>,
    /// Handles to all worker tasks
    pub worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Channel to send dead worker notifications
    supervisor_tx: mpsc::Sender<DeadWorker>,
    /// Worker configuration
    config: WorkerConfig,
    /// Retry policy applied to failed deliveries
    retry: RetryPolicy,
    /// Shared queue channel
    channel: Arc<QueueChannel>,
    /// Handlers by pattern
    registry: Arc<HandlerRegistry>,
    /// Worker statistics
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerManager {
    /// Create a new worker manager
    pub fn new(
        supervisor_tx: mpsc::Sender<DeadWorker>,
        config: WorkerConfig,
        retry: RetryPolicy,
        channel: Arc<QueueChannel>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            active_workers: Arc::new(AtomicUsize::new(0)),
            worker_handles: Arc::new(Mutex::new(Vec::new())),
            supervisor_tx,
            config,
            retry,
            channel,
            registry,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Spawn a new worker
    pub async fn spawn_worker(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        let active_workers = Arc::clone(&self.active_workers);
        let supervisor_tx = self.supervisor_tx.clone();
        let stats = Arc::clone(&self.stats);
        let worker = Worker::new(
            worker_id,
            self.config.clone(),
            self.retry.clone(),
            self.channel.clone(),
            self.registry.clone(),
            stats.clone(),
        );

        // Update total workers count
        stats.lock().await.total_workers += 1;

        let handle = tokio::spawn(async move {
            // Increment active worker count
            active_workers.fetch_add(1, Ordering::Relaxed);
            stats.lock().await.active_workers = active_workers.load(Ordering::Relaxed);

            let death_cause = AssertUnwindSafe(worker.run(shutdown))
                .catch_unwind()
                .await
                .unwrap_or(WorkerDeathCause::Panic);

            // Decrement active worker count
            active_workers.fetch_sub(1, Ordering::Relaxed);
            stats.lock().await.active_workers = active_workers.load(Ordering::Relaxed);

            // Report death to supervisor
            if death_cause != WorkerDeathCause::Normal {
                let dead_worker = DeadWorker {
                    worker_id,
                    cause: death_cause,
                    died_at: SystemTime::now(),
                };
                let _ = supervisor_tx.send(dead_worker).await;
            }
        });

        self.worker_handles.lock().await.push(handle);
        tracing::debug!("🔨 Spawned worker {}", worker_id);
    }

    /// Restart a specific worker (used by supervisor)
    pub async fn restart_worker(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        self.stats.lock().await.worker_restarts += 1;
        self.spawn_worker(worker_id, shutdown).await
    }

    /// Get current worker statistics
    pub async fn stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Wait for all workers to stop after the shutdown signal was sent.
    ///
    /// Workers drain on their own within the configured shutdown timeout;
    /// `timeout_duration` bounds how long to wait for each handle before it
    /// is aborted.
    pub async fn shutdown(&self, timeout_duration: Duration) -> String {
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        if handles.is_empty() {
            return "No workers to shutdown".to_string();
        }

        tracing::info!(
            "🔨 Shutting down {} workers with timeout {:?}",
            handles.len(),
            timeout_duration
        );

        let mut error_count = 0;
        let mut timeout_count = 0;

        for (i, mut handle) in handles.into_iter().enumerate() {
            match timeout(timeout_duration, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::debug!("🔨 Worker handle {} shut down cleanly", i);
                }
                Ok(Err(e)) => {
                    error_count += 1;
                    tracing::error!("🔨 Worker handle {} error: {}", i, e);
                }
                Err(_) => {
                    timeout_count += 1;
                    handle.abort();
                    tracing::warn!("🔨 Worker handle {} timed out, aborted", i);
                }
            }
        }

        let result = format!("{} errors, {} timeouts", error_count, timeout_count);
        tracing::info!("🔨 Worker shutdown complete: {}", result);
        result
    }

    /// Stop every worker immediately, without draining.
    ///
    /// In-flight deliveries are dropped unsettled and the broker redelivers
    /// them, exactly as if the process had crashed.
    pub async fn abort(&self) {
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::warn!("🔨 All workers aborted");
    }

    /// Get the number of active workers
    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }
}
