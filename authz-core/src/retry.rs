//! Retry utilities with exponential backoff.
//!
//! Persistence and fabric failures are retried; business outcomes and
//! validation failures are surfaced immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{AuthzError, ErrorFamily};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a config for quick retries (smaller backoffs), used by tests
    /// and in-memory transports.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Determines whether an error is worth retrying. Only transient
/// persistence, fabric, and external-timeout failures qualify; every
/// authentication, authorization, and validation outcome is permanent.
pub fn is_retryable(err: &AuthzError) -> bool {
    match err.family() {
        ErrorFamily::Persistence => !matches!(err, AuthzError::ConstraintViolation(_)),
        ErrorFamily::Fabric => matches!(
            err,
            AuthzError::Timeout | AuthzError::PublishFailed(_) | AuthzError::ConsumeFailed(_)
        ),
        ErrorFamily::External => matches!(err, AuthzError::ExternalTimeout),
        _ => false,
    }
}

/// Execute an operation with retry logic.
///
/// # Example
/// ```ignore
/// let result = retry_call(
///     &RetryConfig::default(),
///     "resolve_user",
///     || async { handler(request.clone()).await },
/// ).await;
/// ```
pub async fn retry_call<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, AuthzError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AuthzError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        code = err.code(),
                        error = %err,
                        "call failed after max retries"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    code = err.code(),
                    error = %err,
                    backoff_ms = backoff.as_millis(),
                    "call failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(config.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(config.backoff_duration(2), Duration::from_secs(4));
        // Capped at max_backoff.
        assert_eq!(config.backoff_duration(10), Duration::from_secs(30));
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&AuthzError::Timeout));
        assert!(is_retryable(&AuthzError::QueryFailed(anyhow::anyhow!("x"))));
        assert!(is_retryable(&AuthzError::ExternalTimeout));
        assert!(!is_retryable(&AuthzError::ConstraintViolation("dup".into())));
        assert!(!is_retryable(&AuthzError::UserNotFound));
        assert!(!is_retryable(&AuthzError::InsufficientPermissions));
        assert!(!is_retryable(&AuthzError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::quick();
        let result = retry_call(&config, "test_op", || async { Ok::<_, AuthzError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_permanent_failure_not_retried() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_call(&config, "test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(AuthzError::UserNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_failure_retried_to_exhaustion() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_call(&config, "test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(AuthzError::Timeout) }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt + max_retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_call(&config, "test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(AuthzError::Timeout)
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
