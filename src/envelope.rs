//! Task envelope: the durable, individually acknowledgeable unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a task
pub type TaskId = String;

/// Pattern emitted by producers that don't name one explicitly.
pub const DEFAULT_PATTERN: &str = "task_created";

/// A task as it travels through the queue.
///
/// Everything here is part of the wire record. The broker's delivery tag is
/// not: it belongs to one delivery and lives on [`crate::queue::Delivery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Unique task identifier, assigned at submission
    pub id: TaskId,
    /// Event pattern used to route the envelope to a handler
    pub pattern: String,
    /// Arbitrary task data
    pub payload: serde_json::Value,
    /// Number of redeliveries so far (0 on first delivery)
    pub attempt_count: u32,
    /// When the task was first submitted; never changes
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Create a fresh envelope for `payload` under `pattern`.
    pub fn new(pattern: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: pattern.into(),
            payload,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The copy that goes back on the queue after a failed attempt.
    ///
    /// Identity and submission time are preserved.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Minimal-case accessor for `{ "description": ... }` payloads.
    pub fn description(&self) -> Option<&str> {
        self.payload.get("description").and_then(|d| d.as_str())
    }
}

/// Where a single delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded, delivery acked and removed
    Acked,
    /// Failed transiently, a new attempt was queued
    Requeued,
    /// Failed permanently or ran out of retries, moved to the dead-letter queue
    DeadLettered,
    /// Failed permanently or ran out of retries, dropped
    Discarded,
    /// Could not settle; left for the broker to redeliver
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = TaskEnvelope::new(DEFAULT_PATTERN, json!({"description": "send-email"}));
        assert_eq!(envelope.attempt_count, 0);
        assert_eq!(envelope.pattern, "task_created");
        assert_eq!(envelope.description(), Some("send-email"));
        assert!(uuid::Uuid::parse_str(&envelope.id).is_ok());
    }

    #[test]
    fn test_next_attempt_preserves_identity() {
        let first = TaskEnvelope::new("resize", json!({"w": 10}));
        let second = first.next_attempt();
        let third = second.next_attempt();

        assert_eq!(third.attempt_count, 2);
        assert_eq!(third.id, first.id);
        assert_eq!(third.enqueued_at, first.enqueued_at);
        assert_eq!(third.payload, first.payload);
    }

    #[test]
    fn test_description_missing() {
        let envelope = TaskEnvelope::new(DEFAULT_PATTERN, json!({"other": 1}));
        assert_eq!(envelope.description(), None);
    }
}
