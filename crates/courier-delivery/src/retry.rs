//! Retry coordination for failed deliveries.
//!
//! Pairs a pure exponential backoff policy with the shared retry counter
//! store to decide, per failure, between redelivery with a delay and dead
//! lettering. The counter store is consulted atomically so competing worker
//! instances handling redeliveries of the same job cannot double-count an
//! attempt.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::time::Clock;
use serde::{Deserialize, Serialize};

use crate::storage::DeliveryStorage;

/// Retry policy for transient delivery failures.
///
/// Delays double with each consumed attempt: 1s, 2s, 4s under the default
/// policy. Permanent failures never reach this policy; the classifier routes
/// them straight to dead letter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of redeliveries before dead lettering.
    pub max_retries: u32,

    /// Delay before the first redelivery; doubles each attempt after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Computes the redelivery delay for a failure with `attempt_count`
    /// prior attempts.
    ///
    /// `base * 2^attempt_count`, so the first failure (zero prior attempts)
    /// waits one base delay. The exponent is capped to keep pathological
    /// policies from overflowing.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(20);
        self.base_delay * 2_u32.saturating_pow(exponent)
    }
}

/// Decision for one failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Redeliver after the computed backoff.
    Retry {
        /// Ordinal of the attempt just consumed (1-based).
        attempt_number: u32,
        /// Backoff applied before redelivery.
        delay: Duration,
        /// Earliest time the job becomes claimable again.
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted, route to dead letter.
    DeadLetter {
        /// Attempts consumed when the budget ran out.
        attempts: u32,
    },
}

impl RetryVerdict {
    /// Returns true when the job gets another attempt.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decides between delayed redelivery and dead letter for transient
/// failures.
///
/// Owns the policy and the handle to the shared counter store. The
/// coordinator only decides; the caller applies the verdict to the queue.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl RetryCoordinator {
    /// Creates a coordinator over the given counter store.
    pub fn new(policy: RetryPolicy, storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { policy, storage, clock }
    }

    /// Returns the configured policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles one transient failure for the job key.
    ///
    /// Atomically consumes one attempt from the shared counter and either
    /// schedules a redelivery with exponential backoff or, once the budget
    /// is spent, rules dead letter.
    ///
    /// A counter store outage degrades to treating the failure as the first
    /// attempt: retrying optimistically beats failing the job outright.
    pub async fn handle_failure(&self, job_key: &str) -> RetryVerdict {
        let attempts_before = match self.storage.increment_attempts(job_key.to_string()).await {
            Ok(new_count) => new_count.saturating_sub(1),
            Err(error) => {
                tracing::warn!(
                    job_key,
                    %error,
                    "retry counter store unreachable, treating as first attempt"
                );
                0
            },
        };

        if attempts_before < self.policy.max_retries {
            let delay = self.policy.delay_for_attempt(attempts_before);
            let chrono_delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::days(1));

            RetryVerdict::Retry {
                attempt_number: attempts_before + 1,
                delay,
                next_attempt_at: self.clock.now_utc() + chrono_delay,
            }
        } else {
            RetryVerdict::DeadLetter { attempts: attempts_before }
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::time::TestClock;

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn coordinator(storage: Arc<MockDeliveryStorage>) -> RetryCoordinator {
        RetryCoordinator::new(
            RetryPolicy::default(),
            storage,
            Arc::new(TestClock::new()),
        )
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn backoff_exponent_is_capped() {
        let policy = RetryPolicy { max_retries: 100, base_delay: Duration::from_secs(1) };

        assert_eq!(policy.delay_for_attempt(20), policy.delay_for_attempt(21));
    }

    #[tokio::test]
    async fn first_three_failures_retry_with_doubling_delays() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let coordinator = coordinator(storage.clone());

        let expected = [
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
        ];
        for (attempt_number, delay) in expected {
            match coordinator.handle_failure("job-1").await {
                RetryVerdict::Retry { attempt_number: n, delay: d, .. } => {
                    assert_eq!(n, attempt_number);
                    assert_eq!(d, delay);
                },
                RetryVerdict::DeadLetter { .. } => {
                    unreachable!("budget not yet exhausted at attempt {attempt_number}")
                },
            }
        }

        assert_eq!(storage.attempt_counter("job-1").await, 3);
    }

    #[tokio::test]
    async fn fourth_failure_dead_letters() {
        let storage = Arc::new(MockDeliveryStorage::new());
        storage.seed_attempts("job-1", 3).await;
        let coordinator = coordinator(storage);

        let verdict = coordinator.handle_failure("job-1").await;
        assert!(!verdict.should_retry());
        assert!(matches!(verdict, RetryVerdict::DeadLetter { attempts: 3 }));
    }

    #[tokio::test]
    async fn counter_outage_retries_optimistically() {
        let storage = Arc::new(MockDeliveryStorage::new());
        storage.seed_attempts("job-1", 3).await;
        storage.set_counter_outage(true).await;
        let coordinator = coordinator(storage);

        // With the store down the coordinator cannot see the exhausted
        // budget and must fall back to a first-attempt retry.
        let verdict = coordinator.handle_failure("job-1").await;
        match verdict {
            RetryVerdict::Retry { attempt_number, delay, .. } => {
                assert_eq!(attempt_number, 1);
                assert_eq!(delay, Duration::from_secs(1));
            },
            RetryVerdict::DeadLetter { .. } => unreachable!("outage must not dead letter"),
        }
    }

    #[tokio::test]
    async fn next_attempt_time_uses_injected_clock() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = TestClock::new();
        let before = clock.now_utc();
        let coordinator = RetryCoordinator::new(
            RetryPolicy::default(),
            storage,
            Arc::new(clock),
        );

        match coordinator.handle_failure("job-1").await {
            RetryVerdict::Retry { next_attempt_at, .. } => {
                assert_eq!(next_attempt_at, before + chrono::Duration::seconds(1));
            },
            RetryVerdict::DeadLetter { .. } => unreachable!("first failure must retry"),
        }
    }
}
