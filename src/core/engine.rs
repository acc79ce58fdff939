//! The anvilq engine - orchestrates workers, supervisor, and monitor.
//!
//! The engine is responsible for coordinating all the moving parts of the
//! consumer side:
//! - Worker pool management
//! - Worker supervision and recovery
//! - Health monitoring
//! - Graceful shutdown (drain in-flight deliveries, then stop)

use crate::config::AnvilConfig;
use crate::core::handler::HandlerRegistry;
use crate::core::worker::{DeadWorker, WorkerDeathCause, WorkerManager, WorkerStats};
use crate::error::{AnvilError, AnvilResult};
use crate::queue::QueueChannel;
use crate::utils::calculate_backoff;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

/// Extra time granted to workers on top of their own drain timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The engine that runs the worker pool
pub struct AnvilEngine {
    /// Configuration
    config: AnvilConfig,
    /// Shared queue channel
    channel: Arc<QueueChannel>,
    /// Worker manager
    worker_manager: WorkerManager,
    /// Tells workers to stop taking deliveries and drain
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Dead worker reports
    supervisor_rx: Arc<Mutex<mpsc::Receiver<DeadWorker>>>,
    /// First fatal error reported by a worker
    fatal_tx: Arc<watch::Sender<Option<String>>>,
    /// Control flags
    is_running: Arc<AtomicBool>,
    is_shutting_down: Arc<AtomicBool>,
    /// Component handles
    supervisor_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    /// Engine start time for uptime tracking
    start_time: Option<Instant>,
}

impl AnvilEngine {
    /// Create a new engine
    pub fn new(
        config: AnvilConfig,
        channel: Arc<QueueChannel>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (supervisor_tx, supervisor_rx) =
            mpsc::channel::<DeadWorker>(config.workers.num_workers.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);

        let worker_manager = WorkerManager::new(
            supervisor_tx,
            config.workers.clone(),
            config.retry.clone(),
            channel.clone(),
            registry,
        );

        Self {
            config,
            channel,
            worker_manager,
            shutdown_tx: Arc::new(shutdown_tx),
            supervisor_rx: Arc::new(Mutex::new(supervisor_rx)),
            fatal_tx: Arc::new(fatal_tx),
            is_running: Arc::new(AtomicBool::new(false)),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            supervisor_handle: None,
            monitor_handle: None,
            start_time: None,
        }
    }

    /// Start the engine and all its components
    pub async fn start(&mut self) -> AnvilResult<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::AlreadyRunning);
        }

        tracing::info!(
            "Starting anvilq engine with {} workers (prefetch {})",
            self.config.workers.num_workers,
            self.config.workers.prefetch_count
        );

        self.supervisor_handle = Some(self.start_supervisor());
        self.monitor_handle = Some(self.start_monitor());

        // Spawn initial workers
        for worker_id in 0..self.config.workers.num_workers {
            self.worker_manager
                .spawn_worker(worker_id, self.shutdown_tx.subscribe())
                .await;
        }

        self.is_running.store(true, Ordering::Relaxed);
        self.start_time = Some(Instant::now());

        tracing::info!("anvilq engine started successfully");
        Ok(())
    }

    /// Shutdown the engine gracefully
    ///
    /// Workers stop taking deliveries, finish (or time out) what they hold,
    /// settle it with the broker and cancel their subscriptions.
    pub async fn shutdown(&self) -> AnvilResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::NotRunning);
        }

        tracing::info!("Shutting down anvilq engine...");
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_tx.send_replace(true);

        let shutdown_timeout = self.config.workers.shutdown_timeout() + SHUTDOWN_GRACE;
        let shutdown_result = self.worker_manager.shutdown(shutdown_timeout).await;
        tracing::info!("Worker shutdown result: {}", shutdown_result);

        self.stop_components();
        tracing::info!("anvilq engine shutdown complete");
        Ok(())
    }

    /// Stop every worker immediately, without draining.
    ///
    /// Unsettled deliveries go back to the broker, as after a crash.
    pub async fn abort(&self) -> AnvilResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::NotRunning);
        }

        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_tx.send_replace(true);
        self.worker_manager.abort().await;
        self.stop_components();
        Ok(())
    }

    fn stop_components(&self) {
        if let Some(handle) = &self.supervisor_handle {
            handle.abort();
        }
        if let Some(handle) = &self.monitor_handle {
            handle.abort();
        }

        self.is_running.store(false, Ordering::Relaxed);
        self.is_shutting_down.store(false, Ordering::Relaxed);
    }

    /// Wait for Ctrl+C or a fatal worker error, then shut down.
    ///
    /// Returns the fatal error, if that is what stopped the pool.
    pub async fn wait_for_shutdown(&self) -> AnvilResult<()> {
        let fatal = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                None
            }
            fatal = self.wait_for_fatal() => {
                tracing::error!("Fatal error detected, initiating shutdown: {}", fatal);
                Some(fatal)
            }
        };

        self.shutdown().await?;
        match fatal {
            Some(message) => Err(AnvilError::fatal(message)),
            None => Ok(()),
        }
    }

    /// Resolves with the first fatal error reported by the pool.
    pub async fn wait_for_fatal(&self) -> String {
        let mut fatal = self.fatal_tx.subscribe();
        let message = match fatal.wait_for(|fatal| fatal.is_some()).await {
            Ok(message) => message.clone(),
            Err(_) => None,
        };
        match message {
            Some(message) => message,
            None => std::future::pending().await,
        }
    }

    /// Start the worker supervisor
    fn start_supervisor(&self) -> JoinHandle<()> {
        let supervisor_rx = Arc::clone(&self.supervisor_rx);
        let worker_manager = self.worker_manager.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let fatal_tx = self.fatal_tx.clone();
        let is_shutting_down = Arc::clone(&self.is_shutting_down);
        let max_restarts = self.config.workers.max_restart_count;
        let restart_delay_ms = self.config.workers.restart_delay_ms;

        tokio::spawn(async move {
            tracing::info!("Worker supervisor started");

            let mut restart_counts: HashMap<usize, u32> = HashMap::new();

            loop {
                let dead_worker = {
                    let mut rx = supervisor_rx.lock().await;
                    rx.recv().await
                };

                let dead_worker = match dead_worker {
                    Some(dw) => dw,
                    None => break, // Channel closed
                };

                if is_shutting_down.load(Ordering::Relaxed) {
                    break;
                }

                let worker_id = dead_worker.worker_id;
                if let WorkerDeathCause::Fatal(message) = &dead_worker.cause {
                    tracing::error!("Worker {} hit a fatal error: {}", worker_id, message);
                    fatal_tx.send_if_modified(|fatal| {
                        if fatal.is_none() {
                            *fatal = Some(message.clone());
                            true
                        } else {
                            false
                        }
                    });
                    continue;
                }

                let restart_count = restart_counts.entry(worker_id).or_insert(0);
                *restart_count += 1;

                if *restart_count > max_restarts {
                    let message = format!(
                        "worker {} exceeded {} restarts",
                        worker_id, max_restarts
                    );
                    tracing::error!("Too many restarts: {}", message);
                    fatal_tx.send_replace(Some(message));
                    continue;
                }

                tracing::warn!(
                    "Worker {} died ({:?}), restarting... (restart #{})",
                    worker_id,
                    dead_worker.cause,
                    restart_count
                );

                // Exponential backoff for restarts
                if *restart_count > 1 {
                    let backoff_ms =
                        calculate_backoff(*restart_count - 1, restart_delay_ms, 60_000, false);
                    tracing::info!("Backing off {}ms before restart", backoff_ms);
                    sleep(Duration::from_millis(backoff_ms)).await;
                }

                worker_manager
                    .restart_worker(worker_id, shutdown_tx.subscribe())
                    .await;
            }

            tracing::info!("Worker supervisor stopped");
        })
    }

    /// Start the health monitor
    fn start_monitor(&self) -> JoinHandle<()> {
        let worker_manager = self.worker_manager.clone();
        let channel = Arc::clone(&self.channel);
        let expected_workers = self.config.workers.num_workers;
        let is_shutting_down = Arc::clone(&self.is_shutting_down);
        let period = Duration::from_secs(self.config.engine.health_check_interval_secs.max(1));
        let start_time = Instant::now();

        tokio::spawn(async move {
            tracing::info!("Health monitor started");

            let mut interval = interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                if is_shutting_down.load(Ordering::Relaxed) {
                    break;
                }

                let active_count = worker_manager.active_worker_count();
                let worker_stats = worker_manager.stats().await;
                let queue_stats = channel.stats().await;

                let health_status = if !channel.is_connected() {
                    "DISCONNECTED"
                } else if active_count == expected_workers {
                    "HEALTHY"
                } else if active_count > 0 {
                    "DEGRADED"
                } else {
                    "CRITICAL"
                };

                tracing::info!(
                    "HEALTH CHECK - Status: {} | Workers: {}/{} | Queue: depth:{} published:{} retried:{} dead:{} reconnects:{} | Uptime: {:?}",
                    health_status,
                    active_count,
                    expected_workers,
                    queue_stats.depth,
                    queue_stats.published,
                    queue_stats.retried,
                    queue_stats.dead_lettered,
                    queue_stats.reconnects,
                    start_time.elapsed()
                );

                if active_count == 0 {
                    tracing::error!("CRITICAL: All workers are dead!");
                }

                // Log worker performance stats
                if worker_stats.tasks_completed > 0 {
                    tracing::debug!(
                        "Worker performance - Completed: {} | Retried: {} | Dead-lettered: {} | In flight: {} | Restarts: {} | Avg duration: {:?}",
                        worker_stats.tasks_completed,
                        worker_stats.tasks_retried,
                        worker_stats.tasks_dead_lettered,
                        worker_stats.in_flight,
                        worker_stats.worker_restarts,
                        worker_stats.avg_task_duration
                    );
                }
            }

            tracing::info!("Health monitor stopped");
        })
    }

    /// Get worker statistics
    pub async fn worker_stats(&self) -> WorkerStats {
        self.worker_manager.stats().await
    }

    /// Perform a health check
    pub async fn health_check(&self) -> AnvilResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(AnvilError::NotRunning);
        }

        if let Some(message) = self.fatal_tx.borrow().clone() {
            return Err(AnvilError::fatal(message));
        }

        // Check if we have the expected number of workers
        let active_workers = self.worker_manager.active_worker_count();
        let expected_workers = self.config.workers.num_workers;

        if active_workers == 0 {
            return Err(AnvilError::config("No active workers"));
        }

        if active_workers < expected_workers / 2 {
            tracing::warn!(
                "Less than half of expected workers active: {}/{}",
                active_workers,
                expected_workers
            );
        }

        Ok(())
    }

    /// Get engine uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Check if engine is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DEFAULT_PATTERN, TaskEnvelope};
    use crate::queue::{BrokerConnector, InMemoryBroker, QueueSpec};
    use serde_json::json;

    async fn engine(broker: &InMemoryBroker, registry: HandlerRegistry) -> AnvilEngine {
        let config = AnvilConfig::testing();
        let channel = QueueChannel::open(Arc::new(broker.connector()), &config)
            .await
            .unwrap();
        AnvilEngine::new(config, channel, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let broker = InMemoryBroker::new();
        let engine = engine(&broker, HandlerRegistry::new()).await;
        assert!(!engine.is_running());
        assert!(!engine.is_shutting_down());
        assert!(engine.uptime().is_none());
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let broker = InMemoryBroker::new();
        let mut engine = engine(&broker, HandlerRegistry::new()).await;

        // Start engine
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start().await, Err(AnvilError::AlreadyRunning)));

        // Give it a moment to fully start
        sleep(Duration::from_millis(100)).await;

        // Check health
        assert!(engine.health_check().await.is_ok());

        // Shutdown engine
        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(matches!(engine.shutdown().await, Err(AnvilError::NotRunning)));
    }

    #[tokio::test]
    async fn test_engine_processes_tasks() {
        let broker = InMemoryBroker::new();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, |_| async { Ok(()) });
        let mut engine = engine(&broker, registry).await;
        engine.start().await.unwrap();

        for i in 0..5 {
            engine
                .channel
                .publish(&TaskEnvelope::new(DEFAULT_PATTERN, json!({ "n": i })))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.worker_stats().await.tasks_completed < 5 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await.unwrap();
        assert_eq!(broker.depth("task_queue"), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_reported() {
        let broker = InMemoryBroker::new();
        let mut engine = engine(&broker, HandlerRegistry::new()).await;

        // The work queue comes back with other settings while we are away
        assert!(broker.delete_queue("task_queue"));
        let conn = broker.connector().connect().await.unwrap();
        let mut other = QueueSpec::durable("task_queue");
        other.max_length = Some(1);
        conn.declare(&other).await.unwrap();
        broker.disconnect_all();

        engine.start().await.unwrap();
        let fatal = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_fatal())
            .await
            .unwrap();
        assert!(fatal.contains("PRECONDITION_FAILED"));
        assert!(engine.health_check().await.is_err());

        engine.shutdown().await.unwrap();
    }
}
