//! Retry engine: capped exponential backoff with jitter, a per-attempt
//! timeout, and an optional overall deadline per stage.
//!
//! Every external call in the pipeline goes through [`run`]. Adapters only
//! classify errors; whether to try again is decided here, once.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ErrorClass, ServiceError};
use crate::schema::FailureReason;

/// Retry policy for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier for each subsequent wait.
    pub backoff_factor: f64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Add random jitter (±25% of computed delay).
    pub jitter: bool,
    /// Timeout for a single call attempt.
    pub call_timeout_ms: u64,
    /// Hard budget for all attempts and backoff sleeps together.
    pub deadline_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
            call_timeout_ms: 30_000,
            deadline_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt_number` (1-indexed).
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        if attempt_number == 0 {
            return Duration::ZERO;
        }
        let delay_ms =
            self.base_delay_ms as f64 * self.backoff_factor.powi((attempt_number - 1) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        let delay_ms = if self.jitter && delay_ms >= 4 {
            let spread = (delay_ms / 4) as i64;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (delay_ms as i64 + offset).max(0) as u64
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    pub fn should_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Run `op` under `policy`, holding a `limiter` permit only while a call is
/// in flight. `op` receives the 1-indexed attempt number.
pub async fn run<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &Semaphore,
    operation: &str,
    mut op: F,
) -> Result<T, FailureReason>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let started = Instant::now();
    let attempts = AtomicU32::new(0);

    let attempt_loop = async {
        loop {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;

            let outcome = {
                let Ok(_permit) = limiter.acquire().await else {
                    return Err(FailureReason::Internal {
                        detail: format!("{operation}: concurrency limiter closed"),
                    });
                };
                match tokio::time::timeout(policy.call_timeout(), op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout(policy.call_timeout())),
                }
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(operation, attempt, error = %err, "Non-retryable failure");
                return Err(permanent_reason(err));
            }

            if !policy.should_retry(attempt) {
                warn!(
                    operation,
                    attempt,
                    max = policy.max_attempts,
                    error = %err,
                    "Retry policy exhausted"
                );
                return Err(FailureReason::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = policy.delay_for(attempt);
            warn!(
                operation,
                attempt,
                max = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    };

    match policy.deadline() {
        Some(deadline) => match tokio::time::timeout(deadline, attempt_loop).await {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                warn!(operation, attempts, "Stage deadline exceeded");
                Err(FailureReason::DeadlineExceeded {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    attempts,
                })
            }
        },
        None => attempt_loop.await,
    }
}

/// Stage failure for an error that must not be retried.
pub fn permanent_reason(err: ServiceError) -> FailureReason {
    match err {
        ServiceError::UnsupportedFormat(detail) => FailureReason::UnsupportedFormat { detail },
        ServiceError::ContentFiltered(detail) => FailureReason::ContentFiltered { detail },
        ServiceError::UnsupportedVoice(detail) => FailureReason::UnsupportedVoice { detail },
        other if other.class() == ErrorClass::Configuration => FailureReason::Internal {
            detail: other.to_string(),
        },
        other => FailureReason::Rejected {
            detail: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
            call_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn exponential_backoff_grows() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let d1 = policy.delay_for(1).as_millis();
        let d2 = policy.delay_for(2).as_millis();
        let d3 = policy.delay_for(3).as_millis();
        assert!(d2 > d1, "delay should grow: {d1} < {d2}");
        assert!(d3 > d2, "delay should grow: {d2} < {d3}");
    }

    #[test]
    fn respects_max_delay_with_jitter() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            jitter: true,
            ..Default::default()
        };
        for attempt in 1..20 {
            assert!(policy.delay_for(attempt).as_millis() <= 5_000);
        }
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let policy = fast(2);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[tokio::test]
    async fn transient_errors_use_every_attempt() {
        let calls = AtomicUsize::new(0);
        let limiter = Semaphore::new(1);
        let result: Result<(), _> = run(&fast(4), &limiter, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::RateLimited("quota".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(FailureReason::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let limiter = Semaphore::new(1);
        let result: Result<(), _> = run(&fast(5), &limiter, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::ContentFiltered("SAFETY".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(FailureReason::ContentFiltered { .. })
        ));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let limiter = Semaphore::new(1);
        let result = run(&fast(3), &limiter, "test", |attempt| async move {
            if attempt < 3 {
                Err(ServiceError::ServiceUnavailable("503".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_as_transient() {
        let limiter = Semaphore::new(1);
        let policy = RetryPolicy {
            call_timeout_ms: 10,
            ..fast(2)
        };
        let result: Result<(), _> = run(&policy, &limiter, "test", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        match result {
            Err(FailureReason::RetriesExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_cuts_retries_short() {
        let limiter = Semaphore::new(1);
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay_ms: 20,
            max_delay_ms: 20,
            jitter: false,
            call_timeout_ms: 1_000,
            deadline_ms: Some(50),
            ..Default::default()
        };
        let result: Result<(), _> = run(&policy, &limiter, "test", |_| async {
            Err(ServiceError::ServiceUnavailable("down".into()))
        })
        .await;

        match result {
            Err(FailureReason::DeadlineExceeded { attempts, .. }) => {
                assert!(attempts >= 1 && attempts < 100)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
