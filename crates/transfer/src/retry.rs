use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use volsync_protocol::StorageError;

use crate::TransferError;

/// Bounded exponential backoff for remote calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Timeout applied to each individual attempt.
    pub call_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            call_timeout_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay after a failed attempt (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let initial = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let secs = initial * self.backoff_factor.powi(exp);
        let capped = secs.min(Duration::from_millis(self.max_delay_ms).as_secs_f64());
        let jitter = capped * 0.25;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Checks the policy can make progress.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidConfiguration(
                "retry.maxAttempts must be at least 1".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(TransferError::InvalidConfiguration(
                "retry.callTimeoutSecs must be positive".into(),
            ));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(TransferError::InvalidConfiguration(
                "retry.backoffFactor must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Result of one attempt at a remote operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(TransferError),
    Fatal(TransferError),
}

impl<T> From<Result<T, TransferError>> for Attempt<T> {
    fn from(result: Result<T, TransferError>) -> Self {
        match result {
            Ok(v) => Self::Success(v),
            Err(e) if e.is_retryable() => Self::Retryable(e),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, or the attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Each attempt is bounded by the
/// policy's call timeout; an elapsed timeout counts as a retryable failure.
/// Returns the last error once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout(), op(attempt)).await {
            Ok(result) => Attempt::from(result),
            Err(_) => Attempt::Retryable(TransferError::Storage(StorageError::Timeout)),
        };
        match outcome {
            Attempt::Success(v) => return Ok(v),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retryable(e) if attempt >= max_attempts => return Err(e),
            Attempt::Retryable(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    op = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_factor: 2.0,
            call_timeout_secs: 5,
        }
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert!((policy.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.call_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn delay_backoff_is_capped_with_jitter() {
        let policy = RetryPolicy::default();
        // Base delays: 1s, 2s, 4s, 8s, 16s, 30s (capped), 30s...
        let expected_base = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = policy.delay_for_attempt((i + 1) as u32).as_secs_f64();
            assert!(
                secs >= base * 0.74 && secs <= base * 1.26,
                "attempt {}: {secs:.3}s not within ±25% of {base}s",
                i + 1
            );
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let secs = RetryPolicy::default().delay_for_attempt(u32::MAX).as_secs_f64();
        assert!(secs <= 30.0 * 1.26);
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        assert!(fast_policy(0).validate().is_err());
        assert!(fast_policy(1).validate().is_ok());
    }

    #[test]
    fn serde_defaults_missing_fields() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxAttempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TransferError::Storage(StorageError::Network("reset".into())))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransferError::QuotaExceeded("full".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::QuotaExceeded(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(TransferError::Storage(StorageError::Server {
                    status: 524,
                    message: "timeout".into(),
                }))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            call_timeout_secs: 1,
            ..fast_policy(2)
        };
        let err = with_retry(&policy, "test", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TransferError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Storage(StorageError::Timeout)));
    }
}
