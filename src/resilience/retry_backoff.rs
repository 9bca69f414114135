//! Generic exponential-backoff retry helper shared by the Profile Cache,
//! Limit Sync, and Federation egress paths — each wraps a different
//! fallible async call but wants the same jittered-backoff shape.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{Error, ErrorCategory, Result};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(16));
        let capped = exp.min(self.max_delay.as_millis());
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }
}

/// Retries `f` up to `policy.max_attempts` times. Only errors whose
/// category is retryable are retried; anything else is returned
/// immediately on the first failure.
pub async fn retry_with_backoff<F, Fut, T>(policy: BackoffPolicy, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.category() != ErrorCategory::TransientDependency {
                    return Err(err);
                }
                debug!(label, attempt, "retryable failure, backing off");
                let delay = policy.delay_for(attempt);
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal(format!("{label}: exhausted retries"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = BackoffPolicy::new(5, 1);
        let result = retry_with_backoff(policy, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::ProfileUnavailable {
                        user_id: "u1".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable_error() {
        let policy = BackoffPolicy::new(5, 1);
        let result: Result<u32> = retry_with_backoff(policy, "test", || async {
            Err(Error::InvalidTransaction("bad".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::InvalidTransaction(_))));
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_error() {
        let policy = BackoffPolicy::new(3, 1);
        let result: Result<u32> = retry_with_backoff(policy, "test", || async {
            Err(Error::ProfileUnavailable {
                user_id: "u1".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::ProfileUnavailable { .. })));
    }
}
