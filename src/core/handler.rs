//! Task handlers and the pattern registry.
//!
//! Every envelope carries a pattern (`"task_created"` unless the producer
//! picked another). Workers look the pattern up in a [`HandlerRegistry`] and
//! hand the envelope to whatever was registered for it:
//! - a [`TaskHandler`] implementation working on raw envelopes
//! - a closure, via [`HandlerRegistry::register_fn`]
//! - a typed [`AnvilTask`], whose payload is deserialized before `forge` runs
//!
//! # Examples
//!
//! ```rust
//! use anvilq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl AnvilTask for SendEmail {
//!     const PATTERN: &'static str = "send_email";
//!
//!     async fn forge(self) -> AnvilResult<()> {
//!         if self.to.is_empty() {
//!             return Err(AnvilError::permanent("missing recipient"));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let registry = HandlerRegistry::new()
//!     .with_task::<SendEmail>()
//!     .with_fn("task_created", |envelope| async move {
//!         tracing::info!("Received task: {:?}", envelope.description());
//!         Ok(())
//!     });
//! assert_eq!(registry.patterns(), vec!["send_email", "task_created"]);
//! ```

use crate::envelope::TaskEnvelope;
use crate::error::{AnvilError, AnvilResult};
use crate::retry::FailureKind;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Processes envelopes of one pattern.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handle one delivery of `envelope`.
    ///
    /// Return [`AnvilError::HandlerTransient`] for failures worth retrying and
    /// [`AnvilError::HandlerPermanent`] for ones that never will succeed.
    async fn handle(&self, envelope: TaskEnvelope) -> AnvilResult<()>;
}

/// A typed task: the payload is this struct, serialized.
///
#[async_trait]
pub trait AnvilTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Pattern the task is published under
    const PATTERN: &'static str;

    /// Execute the task.
    async fn forge(self) -> AnvilResult<()>;
}

/// Adapter running a closure as a [`TaskHandler`].
pub struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = AnvilResult<()>> + Send + 'static,
{
    async fn handle(&self, envelope: TaskEnvelope) -> AnvilResult<()> {
        (self.handler)(envelope).await
    }
}

/// Adapter decoding the payload into `T` and forging it.
struct TypedHandler<T> {
    _task: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: AnvilTask> TaskHandler for TypedHandler<T> {
    async fn handle(&self, envelope: TaskEnvelope) -> AnvilResult<()> {
        let task: T = serde_json::from_value(envelope.payload).map_err(|e| {
            AnvilError::permanent(format!("invalid payload for {}: {}", T::PATTERN, e))
        })?;
        task.forge().await
    }
}

/// Classify a handler error for the retry policy.
pub fn failure_kind(error: &AnvilError) -> FailureKind {
    match error {
        AnvilError::HandlerTransient { message } => FailureKind::Transient(message.clone()),
        AnvilError::HandlerPermanent { message } => FailureKind::Validation(message.clone()),
        AnvilError::Encode(e) | AnvilError::Decode(e) => FailureKind::Validation(e.to_string()),
        AnvilError::Connection { .. } | AnvilError::NotConnected => FailureKind::Network,
        #[cfg(feature = "amqp")]
        AnvilError::Amqp(_) => FailureKind::Network,
        AnvilError::Timeout { .. } => FailureKind::Timeout,
        AnvilError::PublishRejected { .. } => FailureKind::ResourceExhausted,
        other => FailureKind::Programming(other.to_string()),
    }
}

/// Per-pattern execution statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternStats {
    /// Handler invocations
    pub executed: u64,
    /// Successful invocations
    pub succeeded: u64,
    /// Failed invocations (including timeouts)
    pub failed: u64,
    /// Invocations cut off by the task timeout
    pub timed_out: u64,
    /// Average handler run time
    pub avg_duration: Option<Duration>,
}

/// Registry mapping patterns to handlers.
///
/// Built before the worker pool starts and shared read-only by every slot.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    stats: RwLock<HashMap<String, PatternStats>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, replacing any previous one.
    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let pattern = pattern.into();
        tracing::info!("Registering task handler: {}", pattern);
        if self.handlers.insert(pattern.clone(), handler).is_some() {
            tracing::warn!("Handler for {} replaced", pattern);
        }
    }

    /// Register a closure for `pattern`.
    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<()>> + Send + 'static,
    {
        self.register(pattern, Arc::new(FnHandler { handler }));
    }

    /// Register a typed task under its pattern.
    pub fn register_task<T: AnvilTask>(&mut self) {
        self.register(
            T::PATTERN,
            Arc::new(TypedHandler::<T> {
                _task: PhantomData,
            }),
        );
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with_handler(mut self, pattern: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(pattern, handler);
        self
    }

    /// Builder form of [`HandlerRegistry::register_fn`].
    pub fn with_fn<F, Fut>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<()>> + Send + 'static,
    {
        self.register_fn(pattern, handler);
        self
    }

    /// Builder form of [`HandlerRegistry::register_task`].
    pub fn with_task<T: AnvilTask>(mut self) -> Self {
        self.register_task::<T>();
        self
    }

    /// Handler registered for `pattern`.
    pub fn get(&self, pattern: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(pattern).cloned()
    }

    /// Registered patterns, sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.handlers.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Record the outcome of one handler invocation.
    pub async fn record(&self, pattern: &str, outcome: &Result<(), FailureKind>, duration: Duration) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(pattern.to_string()).or_default();

        entry.executed += 1;
        match outcome {
            Ok(()) => entry.succeeded += 1,
            Err(FailureKind::Timeout) => {
                entry.failed += 1;
                entry.timed_out += 1;
            }
            Err(_) => entry.failed += 1,
        }

        // Simple moving average
        entry.avg_duration = Some(match entry.avg_duration {
            Some(avg) => (avg + duration) / 2,
            None => duration,
        });
    }

    /// Statistics for `pattern`.
    pub async fn pattern_stats(&self, pattern: &str) -> Option<PatternStats> {
        self.stats.read().await.get(pattern).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_PATTERN;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait]
    impl AnvilTask for Resize {
        const PATTERN: &'static str = "resize";

        async fn forge(self) -> AnvilResult<()> {
            if self.width == 0 {
                Err(AnvilError::permanent("zero width"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_fn_handler_receives_envelope() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, move |envelope| {
            let counter = counter.clone();
            async move {
                assert_eq!(envelope.description(), Some("send-email"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handler = registry.get(DEFAULT_PATTERN).unwrap();
        let envelope = TaskEnvelope::new(DEFAULT_PATTERN, json!({"description": "send-email"}));
        handler.handle(envelope).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_task_decodes_payload() {
        let registry = HandlerRegistry::new().with_task::<Resize>();
        let handler = registry.get("resize").unwrap();

        assert!(handler.handle(TaskEnvelope::new("resize", json!({"width": 10}))).await.is_ok());

        let err = handler
            .handle(TaskEnvelope::new("resize", json!({"width": 0})))
            .await
            .unwrap_err();
        assert_eq!(failure_kind(&err), FailureKind::Validation("zero width".to_string()));

        let err = handler
            .handle(TaskEnvelope::new("resize", json!({"height": 3})))
            .await
            .unwrap_err();
        assert!(failure_kind(&err).is_permanent());
    }

    #[test]
    fn test_unknown_pattern() {
        let registry = HandlerRegistry::new().with_task::<Resize>();
        assert!(registry.get("task_created").is_none());
        assert_eq!(registry.patterns(), vec!["resize".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            failure_kind(&AnvilError::transient("db busy")),
            FailureKind::Transient("db busy".to_string())
        );
        assert_eq!(failure_kind(&AnvilError::NotConnected), FailureKind::Network);
        assert_eq!(
            failure_kind(&AnvilError::Timeout { timeout_ms: 5 }),
            FailureKind::Timeout
        );
        assert_eq!(
            failure_kind(&AnvilError::rejected("full")),
            FailureKind::ResourceExhausted
        );
        assert!(failure_kind(&AnvilError::fatal("boom")).is_permanent());
    }

    #[tokio::test]
    async fn test_pattern_stats() {
        let registry = HandlerRegistry::new();
        registry
            .record("resize", &Ok(()), Duration::from_millis(10))
            .await;
        registry
            .record("resize", &Err(FailureKind::Timeout), Duration::from_millis(30))
            .await;

        let stats = registry.pattern_stats("resize").await.unwrap();
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.avg_duration, Some(Duration::from_millis(20)));
        assert!(registry.pattern_stats("other").await.is_none());
    }
}
