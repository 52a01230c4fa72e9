//! Property-based tests for failure classification, retry backoff and
//! circuit breaking.
//!
//! These invariants hold for arbitrary inputs, not just the handful of
//! SMTP replies the unit tests pin down: classification is total and
//! never loses the failure reason, the backoff ladder doubles until its
//! cap, the retry budget is consumed exactly once per failure, and the
//! breaker opens at its threshold and stays shut through the cooldown.

use std::{sync::Arc, time::Duration};

use courier_core::time::TestClock;
use courier_delivery::{
    circuit::{CircuitBreakerManager, CircuitConfig},
    classify::{classify, classify_smtp, matches_permanent_phrase, PERMANENT_CODES,
               PERMANENT_PHRASES},
    error::DeliveryError,
    retry::{RetryCoordinator, RetryPolicy, RetryVerdict},
    storage::mock::MockDeliveryStorage,
};
use proptest::prelude::*;

proptest! {
    /// Every code in the permanent set is a hard bounce, whatever the
    /// server said alongside it.
    #[test]
    fn permanent_codes_classify_permanent_for_any_message(
        idx in 0usize..PERMANENT_CODES.len(),
        message in "[a-zA-Z0-9 .]{0,40}",
    ) {
        let result = classify_smtp(Some(PERMANENT_CODES[idx]), &message);
        prop_assert!(result.is_permanent());
    }

    /// A bounce phrase makes the failure permanent regardless of the
    /// reply code and regardless of letter case.
    #[test]
    fn bounce_phrases_classify_permanent_for_any_code(
        code in prop::option::of(0u16..1000),
        idx in 0usize..PERMANENT_PHRASES.len(),
        uppercase in any::<bool>(),
        prefix in "[a-zA-Z0-9 ]{0,20}",
        suffix in "[a-zA-Z0-9 ]{0,20}",
    ) {
        let phrase = if uppercase {
            PERMANENT_PHRASES[idx].to_uppercase()
        } else {
            PERMANENT_PHRASES[idx].to_string()
        };
        let message = format!("{prefix}{phrase}{suffix}");

        let result = classify_smtp(code, &message);
        prop_assert!(result.is_permanent(), "{message:?} with {code:?} must be permanent");
    }

    /// Anything not provably permanent is transient.
    #[test]
    fn unrecognized_failures_stay_transient(
        code in prop::option::of(0u16..1000),
        message in "[a-zA-Z0-9 ]{0,40}",
    ) {
        prop_assume!(!code.is_some_and(|c| PERMANENT_CODES.contains(&c)));
        prop_assume!(!matches_permanent_phrase(&message));

        let result = classify_smtp(code, &message);
        prop_assert!(!result.is_permanent());
    }

    /// The reason is never empty: the raw message when present, otherwise
    /// a code-derived placeholder.
    #[test]
    fn classification_reason_is_never_lost(
        code in prop::option::of(0u16..1000),
        message in "[a-zA-Z0-9 .]{0,40}",
    ) {
        let result = classify_smtp(code, &message);

        prop_assert!(!result.reason.is_empty());
        if message.is_empty() {
            match code {
                Some(c) => prop_assert_eq!(result.reason, format!("SMTP_{c}")),
                None => prop_assert_eq!(result.reason, "SMTP_unknown"),
            }
        } else {
            prop_assert_eq!(result.reason, message);
        }
    }

    /// Classifying the error enum agrees with classifying its parts.
    #[test]
    fn smtp_rejection_errors_classify_like_their_parts(
        code in prop::option::of(400u16..600),
        message in "[a-zA-Z0-9 .]{1,40}",
    ) {
        let from_error = classify(&DeliveryError::smtp_rejection(code, message.clone()));
        let from_parts = classify_smtp(code, &message);
        prop_assert_eq!(from_error, from_parts);
    }

    /// Backoff doubles with each consumed attempt below the exponent cap.
    #[test]
    fn backoff_doubles_per_attempt_below_the_cap(
        base_ms in 1u64..10_000,
        attempt in 0u32..19,
    ) {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
        };

        prop_assert_eq!(
            policy.delay_for_attempt(attempt + 1),
            policy.delay_for_attempt(attempt) * 2
        );
    }

    /// Past twenty attempts the delay stops growing.
    #[test]
    fn backoff_exponent_caps_at_twenty(
        base_ms in 1u64..10_000,
        extra in 0u32..100,
    ) {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
        };

        prop_assert_eq!(policy.delay_for_attempt(20 + extra), policy.delay_for_attempt(20));
    }

    /// Each failure consumes exactly one attempt; the verdict flips from
    /// retry to dead letter precisely when the budget runs out.
    #[test]
    fn failure_consumes_one_attempt_and_respects_the_budget(
        prior in 0u32..8,
        max_retries in 1u32..6,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let storage = Arc::new(MockDeliveryStorage::new());
            storage.seed_attempts("job-p", prior).await;

            let policy = RetryPolicy { max_retries, base_delay: Duration::from_millis(50) };
            let coordinator = RetryCoordinator::new(
                policy.clone(),
                storage.clone(),
                Arc::new(TestClock::new()),
            );

            let verdict = coordinator.handle_failure("job-p").await;
            if prior < max_retries {
                match verdict {
                    RetryVerdict::Retry { attempt_number, delay, .. } => {
                        prop_assert_eq!(attempt_number, prior + 1);
                        prop_assert_eq!(delay, policy.delay_for_attempt(prior));
                    },
                    RetryVerdict::DeadLetter { .. } => {
                        prop_assert!(false, "budget not exhausted at {prior} prior attempts");
                    },
                }
            } else {
                prop_assert_eq!(verdict, RetryVerdict::DeadLetter { attempts: prior });
            }

            prop_assert_eq!(storage.attempt_counter("job-p").await, prior + 1);
            Ok(())
        })?;
    }

    /// The breaker opens at exactly the configured threshold.
    #[test]
    fn breaker_opens_exactly_at_the_threshold(
        threshold in 1u32..8,
        failures in 0u32..12,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let manager = CircuitBreakerManager::with_clock(
                CircuitConfig {
                    failure_threshold: threshold,
                    cooldown: Duration::from_secs(10),
                },
                Arc::new(TestClock::new()),
            );

            for _ in 0..failures {
                manager.record_failure("relay").await;
            }

            let allowed = manager.can_request("relay").await;
            prop_assert_eq!(allowed, failures < threshold);
            Ok(())
        })?;
    }

    /// An open breaker denies until strictly more than the cooldown has
    /// elapsed, then permits the probe.
    #[test]
    fn open_breaker_probes_only_after_strict_cooldown(
        threshold in 1u32..5,
        waited in 0u64..30,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let clock = Arc::new(TestClock::new());
            let manager = CircuitBreakerManager::with_clock(
                CircuitConfig {
                    failure_threshold: threshold,
                    cooldown: Duration::from_secs(10),
                },
                clock.clone(),
            );

            for _ in 0..threshold {
                manager.record_failure("relay").await;
            }
            clock.advance(Duration::from_secs(waited));

            let allowed = manager.can_request("relay").await;
            prop_assert_eq!(allowed, waited > 10, "waited {}s against a 10s cooldown", waited);
            Ok(())
        })?;
    }
}
