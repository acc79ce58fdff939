//! Delivery/retry policy.
//!
//! A pure decision function: given how many times an envelope has already
//! been attempted and what kind of failure the latest attempt hit, decide
//! whether it goes back on the queue (now or later) or leaves it for good.
//! The policy never touches the broker; the worker turns the decision into
//! publishes, acks and nacks.

use crate::utils::apply_jitter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of a failed processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Broker or downstream dependency unreachable
    Network,
    /// Handler exceeded the per-task timeout
    Timeout,
    /// Out of some resource (pool, memory, rate limit)
    ResourceExhausted,
    /// Handler reported a failure that may succeed later
    Transient(String),
    /// Envelope bytes could not be decoded
    Decode,
    /// Payload rejected by the handler as invalid
    Validation(String),
    /// Handler bug (panic, invariant violation)
    Programming(String),
    /// No handler registered for the envelope's pattern
    UnknownPattern(String),
}

impl FailureKind {
    /// Permanent failures are never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Decode | Self::Validation(_) | Self::Programming(_) | Self::UnknownPattern(_)
        )
    }
}

/// What to do with an envelope after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back on the main queue immediately
    Requeue,
    /// Put it back after the given delay
    RequeueWithDelay(Duration),
    /// Remove it from the main queue (dead-letter or drop)
    Discard,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Retry policy configuration.
///
/// `max_retries` counts redeliveries: with `max_retries = 3` an envelope that
/// always fails transiently is attempted with `attempt_count` 0, 1, 2 and 3,
/// and the failure at 3 discards it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of redeliveries after the first attempt
    pub max_retries: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,

    /// Whether to enable jitter in delay calculations
    pub enable_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 60000, // 1 minute
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            enable_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Create a retry policy with linear backoff.
    pub fn linear(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_strategy: BackoffStrategy::Linear { increment_ms: 1000 },
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
            enable_jitter: false,
        }
    }

    /// Retry immediately, without going through the delay queue.
    pub fn immediate(max_retries: u32) -> Self {
        Self::fixed(max_retries, 0)
    }

    /// Disable retries completely.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Decide the fate of an envelope whose attempt number `attempt_count`
    /// just failed with `failure`.
    pub fn decide(&self, attempt_count: u32, failure: &FailureKind) -> RetryDecision {
        if failure.is_permanent() || attempt_count >= self.max_retries {
            return RetryDecision::Discard;
        }

        let delay = self.delay_for(attempt_count);
        if delay.is_zero() {
            RetryDecision::Requeue
        } else {
            RetryDecision::RequeueWithDelay(delay)
        }
    }

    /// Backoff before redelivering an envelope that failed at `attempt_count`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let raw_ms = match &self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear { increment_ms } => self
                .base_delay_ms
                .saturating_add(increment_ms.saturating_mul(attempt_count as u64)),
            BackoffStrategy::Exponential { multiplier } => {
                let scaled = self.base_delay_ms as f64 * multiplier.powi(attempt_count as i32);
                if scaled.is_finite() && scaled < u64::MAX as f64 {
                    scaled as u64
                } else {
                    u64::MAX
                }
            }
        };

        let capped = raw_ms.min(self.max_delay_ms);
        let delay_ms = if self.enable_jitter {
            apply_jitter(capped)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(mut policy: RetryPolicy) -> RetryPolicy {
        policy.enable_jitter = false;
        policy
    }

    #[test]
    fn test_transient_retries_until_ceiling() {
        let policy = no_jitter(RetryPolicy::exponential(3));

        for attempt in 0..3 {
            assert!(matches!(
                policy.decide(attempt, &FailureKind::Network),
                RetryDecision::RequeueWithDelay(_)
            ));
        }
        assert_eq!(policy.decide(3, &FailureKind::Network), RetryDecision::Discard);
        assert_eq!(policy.decide(7, &FailureKind::Timeout), RetryDecision::Discard);
    }

    #[test]
    fn test_permanent_discards_regardless_of_attempts() {
        let policy = RetryPolicy::exponential(10);

        assert_eq!(policy.decide(0, &FailureKind::Decode), RetryDecision::Discard);
        assert_eq!(
            policy.decide(0, &FailureKind::Validation("missing field".into())),
            RetryDecision::Discard
        );
        assert_eq!(
            policy.decide(0, &FailureKind::UnknownPattern("nope".into())),
            RetryDecision::Discard
        );
        assert_eq!(
            policy.decide(2, &FailureKind::Programming("panic".into())),
            RetryDecision::Discard
        );
    }

    #[test]
    fn test_zero_delay_requeues_immediately() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(
            policy.decide(0, &FailureKind::Transient("db down".into())),
            RetryDecision::Requeue
        );
        assert_eq!(policy.decide(2, &FailureKind::ResourceExhausted), RetryDecision::Discard);
    }

    #[test]
    fn test_no_retries_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.decide(0, &FailureKind::Network), RetryDecision::Discard);
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_retries: 20,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            enable_jitter: false,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(19), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = no_jitter(RetryPolicy::linear(5));
        assert_eq!(linear.delay_for(0), Duration::from_millis(1000));
        assert_eq!(linear.delay_for(2), Duration::from_millis(3000));

        let fixed = RetryPolicy::fixed(5, 250);
        assert_eq!(fixed.delay_for(0), Duration::from_millis(250));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(250));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::exponential(5);
        for attempt in 0..5 {
            let delay = policy.delay_for(attempt);
            let ceiling = no_jitter(policy.clone()).delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn test_failure_kind_classification() {
        assert!(!FailureKind::Network.is_permanent());
        assert!(!FailureKind::Timeout.is_permanent());
        assert!(!FailureKind::ResourceExhausted.is_permanent());
        assert!(!FailureKind::Transient("x".into()).is_permanent());
        assert!(FailureKind::Decode.is_permanent());
    }

    fn failure_kind() -> impl Strategy<Value = FailureKind> {
        prop_oneof![
            Just(FailureKind::Network),
            Just(FailureKind::Timeout),
            Just(FailureKind::ResourceExhausted),
            Just(FailureKind::Decode),
            ".{0,12}".prop_map(FailureKind::Transient),
            ".{0,12}".prop_map(FailureKind::Validation),
            ".{0,12}".prop_map(FailureKind::Programming),
            ".{0,12}".prop_map(FailureKind::UnknownPattern),
        ]
    }

    fn backoff_strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            (0u64..10_000).prop_map(|increment_ms| BackoffStrategy::Linear { increment_ms }),
            (1u8..=4).prop_map(|m| BackoffStrategy::Exponential {
                multiplier: f64::from(m),
            }),
        ]
    }

    fn retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (
            0u32..10,
            0u64..5_000,
            0u64..120_000,
            backoff_strategy(),
            any::<bool>(),
        )
            .prop_map(
                |(max_retries, base_delay_ms, max_delay_ms, backoff_strategy, enable_jitter)| {
                    RetryPolicy {
                        max_retries,
                        base_delay_ms,
                        max_delay_ms,
                        backoff_strategy,
                        enable_jitter,
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn never_requeues_past_ceiling_or_permanent_failure(
            policy in retry_policy(),
            attempt in 0u32..20,
            failure in failure_kind(),
        ) {
            let decision = policy.decide(attempt, &failure);
            if attempt >= policy.max_retries || failure.is_permanent() {
                prop_assert_eq!(decision, RetryDecision::Discard);
            } else {
                prop_assert_ne!(decision, RetryDecision::Discard);
            }
        }

        #[test]
        fn delays_never_shrink_and_stay_capped(
            policy in retry_policy().prop_map(no_jitter),
            attempt in 0u32..40,
        ) {
            let delay = policy.delay_for(attempt);
            prop_assert!(delay <= policy.delay_for(attempt + 1));
            prop_assert!(delay <= Duration::from_millis(policy.max_delay_ms));
        }

        #[test]
        fn jittered_delays_stay_capped(policy in retry_policy(), attempt in 0u32..40) {
            prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(policy.max_delay_ms));
        }
    }
}
