//! Producer side: turns payloads into durable envelopes on the work queue.

use crate::core::handler::AnvilTask;
use crate::envelope::{DEFAULT_PATTERN, TaskEnvelope, TaskId};
use crate::error::{AnvilError, AnvilResult};
use crate::queue::QueueChannel;
use serde::Serialize;
use std::sync::Arc;

/// Submits tasks through a shared [`QueueChannel`].
///
/// Cheap to clone; every clone publishes over the same connection.
#[derive(Clone, Debug)]
pub struct Submitter {
    channel: Arc<QueueChannel>,
}

impl Submitter {
    /// Create a submitter on top of an open channel.
    pub fn new(channel: Arc<QueueChannel>) -> Self {
        Self { channel }
    }

    /// Submit `payload` under the default `task_created` pattern.
    ///
    /// Returns the new task id once the broker holds the message (see
    /// [`crate::config::ConfirmMode`]). A disconnected channel yields
    /// [`AnvilError::NotConnected`] and nothing is recorded.
    pub async fn submit<P: Serialize + ?Sized>(&self, payload: &P) -> AnvilResult<TaskId> {
        self.submit_pattern(DEFAULT_PATTERN, payload).await
    }

    /// Submit `payload` under an explicit pattern.
    pub async fn submit_pattern<P: Serialize + ?Sized>(
        &self,
        pattern: &str,
        payload: &P,
    ) -> AnvilResult<TaskId> {
        let payload = serde_json::to_value(payload).map_err(AnvilError::Encode)?;
        self.submit_envelope(TaskEnvelope::new(pattern, payload)).await
    }

    /// Submit a typed task under its own pattern.
    pub async fn submit_task<T: AnvilTask>(&self, task: &T) -> AnvilResult<TaskId> {
        self.submit_pattern(T::PATTERN, task).await
    }

    /// Publish a prepared envelope as-is.
    pub async fn submit_envelope(&self, envelope: TaskEnvelope) -> AnvilResult<TaskId> {
        let ack = self.channel.publish(&envelope).await?;
        tracing::debug!(
            "Task {} submitted (pattern: {}, {:?})",
            envelope.id,
            envelope.pattern,
            ack
        );
        Ok(envelope.id)
    }

    /// Whether publishes can currently succeed.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Name of the work queue tasks land in.
    pub fn queue_name(&self) -> &str {
        self.channel.queue_name()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<QueueChannel> {
        &self.channel
    }
}
