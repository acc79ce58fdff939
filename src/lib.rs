//! # anvilq
//!
//! Durable, at-least-once task dispatch over a message broker.
//!
//! Producers submit tasks quickly; one or more worker processes pull them
//! from a durable queue and forge them at their own pace.
//!
//! ## Features
//!
//! - **Durable Delivery**: persistent messages on durable queues, publisher confirms
//! - **Manual Acks**: a task leaves the queue only after its handler succeeded
//! - **Retries**: transient failures come back with backoff through a delay queue
//! - **Dead Letters**: permanent failures and exhausted retries are parked, never dropped
//! - **Reconnect**: the channel reconnects and redeclares its queues on its own
//! - **Graceful Shutdown**: in-flight tasks are drained before workers stop
//!
//! ## Quick Start
//!
//! ```rust
//! use anvilq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct EmailTask {
//!     to: String,
//!     subject: String,
//! }
//!
//! #[async_trait]
//! impl AnvilTask for EmailTask {
//!     const PATTERN: &'static str = "email";
//!
//!     async fn forge(self) -> AnvilResult<()> {
//!         // Your task logic here
//!         tracing::info!("Email sent to {}", self.to);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let broker = InMemoryBroker::new();
//!     let registry = HandlerRegistry::new().with_task::<EmailTask>();
//!     let anvil = Anvil::in_memory(AnvilConfig::testing(), &broker, registry).await?;
//!
//!     // Start workers
//!     anvil.start_forging().await?;
//!
//!     anvil
//!         .submit_task(&EmailTask {
//!             to: "user@example.com".to_string(),
//!             subject: "Welcome".to_string(),
//!         })
//!         .await?;
//!
//!     anvil.close().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod core;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod utils;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod http;

pub mod prelude {
    pub use crate::codec::{EnvelopeCodec, JsonCodec};
    pub use crate::config::*;
    pub use crate::core::{Anvil, AnvilTask, HandlerRegistry, Submitter, TaskHandler, WorkerStats};
    pub use crate::envelope::{DEFAULT_PATTERN, DeliveryOutcome, TaskEnvelope, TaskId};
    pub use crate::error::{AnvilError, AnvilResult};
    pub use crate::queue::{ChannelStatus, InMemoryBroker, QueueChannel, QueueStats};
    pub use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
    pub use async_trait::async_trait;

    #[cfg(feature = "amqp")]
    #[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
    pub use crate::queue::AmqpConnector;
}

pub use crate::config::*;
pub use crate::core::{Anvil, AnvilTask, HandlerRegistry, Submitter, TaskHandler};
pub use crate::envelope::{TaskEnvelope, TaskId};
pub use crate::error::{AnvilError, AnvilResult};
pub use crate::queue::{InMemoryBroker, QueueChannel};
pub use crate::retry::RetryPolicy;
pub use async_trait::async_trait;
