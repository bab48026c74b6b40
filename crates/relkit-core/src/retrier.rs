//! Bounded retry with a pluggable policy.
//!
//! A [`Retrier`] runs an async operation until it succeeds, the policy
//! declines, or the time budget is spent. The final failure is wrapped in
//! [`ReleaseError::RetriesExhausted`] carrying the attempt count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{RetrySettings, MAIN_BRANCH};
use crate::error::{ReleaseError, Result};

/// Decides, from the zero-based retry count and the last error, whether to
/// try again and how long to wait first.
pub type RetryPolicy = Arc<dyn Fn(u32, &ReleaseError) -> (bool, Duration) + Send + Sync>;

#[derive(Clone)]
pub struct Retrier {
    budget: Duration,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    pub fn new(budget: Duration, policy: RetryPolicy) -> Self {
        Self { budget, policy }
    }

    /// Retrier for objects that may not be visible yet.
    pub fn not_found(branch: &str, settings: RetrySettings) -> Self {
        Self::new(settings.budget, not_found_policy(branch, settings))
    }

    /// Retrier for any transient failure.
    pub fn transient(settings: RetrySettings) -> Self {
        Self::new(settings.budget, transient_policy(settings))
    }

    /// Run `op` until success, policy refusal, or budget exhaustion.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut retries: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let (again, wait) = (self.policy)(retries, &err);
            let attempts = retries + 1;
            if !again || start.elapsed() + wait >= self.budget {
                return Err(ReleaseError::RetriesExhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            debug!(attempt = attempts, wait_ms = wait.as_millis() as u64, error = %err, "retrying");
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            } else {
                tokio::task::yield_now().await;
            }
            retries += 1;
        }
    }
}

/// Retry only not-yet-visible errors, and only on the main line.
///
/// Other branches fail fast so the caller can fall back to the main-line
/// artifact.
pub fn not_found_policy(branch: &str, settings: RetrySettings) -> RetryPolicy {
    let on_main = branch == MAIN_BRANCH;
    Arc::new(move |retries, err| {
        if on_main && err.is_not_found() && retries < settings.max_retries {
            (true, settings.wait)
        } else {
            (false, Duration::ZERO)
        }
    })
}

/// Retry any error up to the configured count.
pub fn transient_policy(settings: RetrySettings) -> RetryPolicy {
    Arc::new(move |retries, _err| {
        if retries < settings.max_retries {
            (true, settings.wait)
        } else {
            (false, Duration::ZERO)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn not_found() -> ReleaseError {
        ReleaseError::ObjectNotFound {
            key: "projects/x/latest/x.tar.gz".to_string(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::transient(RetrySettings::immediate(5));
        let c = Arc::clone(&calls);
        let value = retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ReleaseError::Git("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_policy_stops_at_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::transient(RetrySettings::immediate(3));
        let c = Arc::clone(&calls);
        let err = retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ReleaseError::Git("down".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            ReleaseError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_matching_error_is_fatal_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::not_found(MAIN_BRANCH, RetrySettings::immediate(60));
        let c = Arc::clone(&calls);
        let err = retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ReleaseError::InvalidVersion("v1".into()))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("retries exhausted"));
    }

    #[tokio::test]
    async fn not_found_is_not_retried_off_main() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::not_found("release-0.18", RetrySettings::immediate(60));
        let c = Arc::clone(&calls);
        let err = retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(not_found())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn not_found_retried_on_main() {
        let calls = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::not_found(MAIN_BRANCH, RetrySettings::immediate(60));
        let c = Arc::clone(&calls);
        retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 5 {
                        Err(not_found())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn always_retry_policy_terminates_on_budget() {
        let policy: RetryPolicy = Arc::new(|_, _| (true, Duration::ZERO));
        let retrier = Retrier::new(Duration::from_millis(50), policy);
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = retrier
            .retry(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<(), _>(ReleaseError::Git("never".into()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::RetriesExhausted { .. }));
        assert!(calls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let retrier = Retrier::transient(RetrySettings {
            max_retries: 2,
            wait: Duration::from_secs(30),
            budget: Duration::from_secs(3600),
        });
        let start = Instant::now();
        let _ = retrier
            .retry(|| async { Err::<(), _>(ReleaseError::Git("x".into())) })
            .await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
