//! Generic retry, fallback and error-logging wrappers for async operations.
//!
//! Delays grow geometrically: with the default policy (1 s, factor 2.0,
//! 3 retries) the waits are 1 s → 2 s → 4 s.

use crate::error::OcrError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.backoff_factor.max(1.0).powi(exp))
    }
}

/// Run `op` up to `max_retries + 1` times while `should_retry` accepts the
/// error. Returns the first success or the last error.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    op_name: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_retries || !should_retry(&e) {
                    if attempt > 0 {
                        error!("{}: giving up after {} attempts: {}", op_name, attempt + 1, e);
                    }
                    return Err(e);
                }
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    "{}: attempt {} failed ({}), retry {}/{} in {:?}",
                    op_name, attempt, e, attempt, policy.max_retries, delay
                );
                sleep(delay).await;
            }
        }
    }
}

/// Run `primary`; on error, log and run `fallback` instead.
pub async fn with_fallback<T, E, P, F>(op_name: &str, primary: P, fallback: F) -> Result<T, E>
where
    E: std::fmt::Display,
    P: Future<Output = Result<T, E>>,
    F: Future<Output = Result<T, E>>,
{
    match primary.await {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!("{}: primary failed ({}), running fallback", op_name, e);
            fallback.await
        }
    }
}

/// Run `op` and log any error with its remedy before returning it unchanged.
pub async fn log_errors<T, Fut>(op_name: &str, op: Fut) -> Result<T, OcrError>
where
    Fut: Future<Output = Result<T, OcrError>>,
{
    let result = op.await;
    if let Err(ref e) = result {
        error!("{}: {}\n{}", op_name, e, e.suggestion());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn delays_grow_geometrically() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = retry(&fast(), "flaky", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("fail {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = retry(&fast(), "broken", |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert_eq!(out, Err("nope".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = retry(&fast(), "fatal", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal".to_string()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_runs_on_primary_error() {
        let out: Result<&str, String> =
            with_fallback("load", async { Err("gpu".to_string()) }, async { Ok("cpu") }).await;
        assert_eq!(out, Ok("cpu"));
    }

    #[tokio::test]
    async fn log_errors_passes_error_through() {
        let out: Result<(), OcrError> = log_errors("op", async { Err(OcrError::Cancelled) }).await;
        assert!(matches!(out, Err(OcrError::Cancelled)));
    }
}
