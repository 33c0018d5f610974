//! Retry with exponential backoff and equal jitter.
//!
//! [`with_retry`] is the only place backoff is implemented. Its result is a
//! [`RetryOutcome`] so callers distinguish "gave up on a transient failure"
//! from "the backend refused outright" without inspecting error strings.

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

use labelwise_core::RetryPolicy;

use crate::providers::BackendError;

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    /// The operation succeeded on call number `attempts`.
    Success { value: T, attempts: u32 },

    /// Transient failures outlasted the policy.
    Exhausted { last_error: BackendError, attempts: u32 },

    /// A non-retryable failure ended the operation immediately.
    Fatal { error: BackendError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    /// Calls issued, cache hits count as zero.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Fatal { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }
}

/// Nominal delays between attempts: `min_backoff * 2^k`, capped at
/// `max_backoff`, at most `max_attempts - 1` of them.
pub fn backoff_schedule(policy: &RetryPolicy) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(policy.min_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(2.0)
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize)
        .build()
}

/// Equal jitter: uniform in `[delay / 2, delay]`.
pub fn jittered(delay: Duration) -> Duration {
    let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    let low = nanos / 2;
    Duration::from_nanos(rand::thread_rng().gen_range(low..=nanos))
}

/// Delay actually slept after `error`: jittered nominal delay, raised to the
/// server's `retry_after` hint, never above `max_backoff`.
fn retry_delay(nominal: Duration, error: &BackendError, policy: &RetryPolicy) -> Duration {
    let delay = jittered(nominal);
    let delay = match error.retry_after() {
        Some(hint) => delay.max(hint),
        None => delay,
    };
    delay.min(policy.max_backoff)
}

/// Run `operation` until it succeeds, fails fatally, or the policy gives up.
///
/// `operation` receives the 1-based attempt number. It is called at most
/// `policy.max_attempts` times and the summed sleep never exceeds
/// `(max_attempts - 1) * max_backoff`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut schedule = backoff_schedule(policy);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        if error.is_fatal() {
            tracing::warn!(attempt, error = %error, "Fatal backend failure, not retrying");
            return RetryOutcome::Fatal {
                error,
                attempts: attempt,
            };
        }

        if !policy.is_retryable(error.kind()) {
            tracing::debug!(attempt, kind = %error.kind(), "Failure kind not retryable");
            return RetryOutcome::Exhausted {
                last_error: error,
                attempts: attempt,
            };
        }

        let Some(nominal) = schedule.next() else {
            tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
            return RetryOutcome::Exhausted {
                last_error: error,
                attempts: attempt,
            };
        };

        let delay = retry_delay(nominal, &error, policy);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient backend failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelwise_core::FailureKind;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32, min_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_backoff: Duration::from_millis(min_ms),
            max_backoff: Duration::from_millis(max_ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_schedule_matches_nominal_delays() {
        let policy = policy(6, 100, 500);
        let delays: Vec<Duration> = backoff_schedule(&policy).collect();
        assert_eq!(delays.len(), 5);
        for (k, delay) in delays.iter().enumerate() {
            let nominal = policy.nominal_delay(k as u32 + 1);
            let diff = delay.abs_diff(nominal);
            assert!(diff < Duration::from_millis(1), "{:?} vs {:?}", delay, nominal);
        }
    }

    #[test]
    fn test_single_attempt_policy_has_no_delays() {
        assert_eq!(backoff_schedule(&RetryPolicy::no_retry()).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = with_retry(&policy(3, 100, 1000), move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::server(Some(502), "bad gateway"))
                } else {
                    Ok("1")
                }
            }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Success {
                value: "1",
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_timeouts_exhaust() {
        let outcome: RetryOutcome<()> = with_retry(&policy(3, 100, 1000), |_| async {
            Err(BackendError::Timeout(Duration::from_secs(30)))
        })
        .await;

        match outcome {
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.kind(), FailureKind::Timeout);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let outcome: RetryOutcome<()> = with_retry(&policy(5, 100, 1000), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::AuthError("invalid key".into())) }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Fatal { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlisted_transient_kind_is_not_retried() {
        let mut policy = policy(5, 100, 1000);
        policy.retryable.remove(&FailureKind::RateLimited);

        let outcome: RetryOutcome<()> = with_retry(&policy, |_| async {
            Err(BackendError::RateLimited { retry_after: None })
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_bounded() {
        let policy = policy(4, 200, 500);
        let start = Instant::now();

        let outcome: RetryOutcome<()> = with_retry(&policy, |_| async {
            Err(BackendError::server(Some(500), "boom"))
        })
        .await;

        let elapsed = start.elapsed();
        assert_eq!(outcome.attempts(), 4);
        // Nominal 200 + 400 + 500, each jittered down to at most half.
        assert!(elapsed >= Duration::from_millis(550), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1100), "{:?}", elapsed);
        assert!(elapsed <= policy.max_backoff * (policy.max_attempts - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored_but_capped() {
        let policy = policy(2, 100, 2000);
        let start = Instant::now();
        let _: RetryOutcome<()> = with_retry(&policy, |_| async {
            Err(BackendError::RateLimited {
                retry_after: Some(Duration::from_millis(1500)),
            })
        })
        .await;
        assert_eq!(start.elapsed(), Duration::from_millis(1500));

        let start = Instant::now();
        let _: RetryOutcome<()> = with_retry(&policy, |_| async {
            Err(BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            })
        })
        .await;
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_numbers_are_passed_through() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        let _: RetryOutcome<()> = with_retry(&policy(3, 10, 10), move |attempt| {
            log.lock().push(attempt);
            async { Err(BackendError::Timeout(Duration::ZERO)) }
        })
        .await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_within_half_and_full(ms in 0u64..100_000) {
            let delay = Duration::from_millis(ms);
            let j = jittered(delay);
            prop_assert!(j <= delay);
            prop_assert!(j >= delay / 2);
        }

        #[test]
        fn prop_schedule_respects_bounds(
            max_attempts in 1u32..10,
            min_ms in 1u64..1000,
            extra_ms in 0u64..5000,
        ) {
            let policy = policy(max_attempts, min_ms, min_ms + extra_ms);
            let delays: Vec<Duration> = backoff_schedule(&policy).collect();
            prop_assert_eq!(delays.len() as u32, max_attempts - 1);
            for delay in delays {
                prop_assert!(delay <= policy.max_backoff);
                prop_assert!(delay >= policy.min_backoff);
            }
        }
    }
}
