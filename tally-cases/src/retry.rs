//! Bounded exponential backoff for transient store failures.

use std::future::Future;

use tally_core::{RetryPolicy, TallyError, TallyResult};

/// Final error of a retried operation and how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: TallyError,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the policy runs out of retries. The closure receives the 1-based attempt
/// number.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TallyResult<T>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retries_left = max_attempts.saturating_sub(attempt);
                if !error.is_transient() || retries_left == 0 {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    });
                }

                let delay = policy.delay_for_retry(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    retries_left,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt {attempt} failed. There are {retries_left} retries left."
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tally_core::StorageError;
    use tokio::time::Instant;

    fn unavailable() -> TallyError {
        TallyError::Storage(StorageError::Unavailable {
            reason: "503".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_with_backoff() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = retry_transient(&policy, "update", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(unavailable())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s before the 2nd attempt, 2s before the 3rd.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let policy = RetryPolicy::default();
        let started = Instant::now();

        let failure = retry_transient(&policy, "update", |_| async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.error, unavailable());
        // 1s + 2s + 3s (capped from 4s).
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_millis(6100));
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let failure = retry_transient(&policy, "update", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(TallyError::Storage(StorageError::NotFound {
                    object_type: "cases".to_string(),
                    id: "gone".to_string(),
                }))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
