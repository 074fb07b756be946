//! Adaptive retry with exponential backoff.
//!
//! Every LLM call the kernel makes goes through [`retry_with_backoff`].
//! Failures are categorised (see [`ErrorCategory`](crate::ErrorCategory))
//! and only the transient categories (`network`, `rate_limit`, `server`) are
//! retried. A call with `max_retries = k` makes at most `k + 1` attempts.
//!
//! The delay for attempt `n` (0-based) is `base_delay * 2^n`, capped at
//! `max_delay` and jittered by `jitter_factor` to avoid thundering herds.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::KernelConfig;
use crate::error::{Error, Result};

/// Configuration for retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Jitter factor, 0.0 to 1.0.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Derive the retry configuration from the kernel config.
    pub fn from_kernel(config: &KernelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_retry_delay,
            max_delay: Duration::from_secs(60),
            jitter_factor: config.retry_jitter,
        }
    }

    /// Set the retry count.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter factor (clamped to 0.0..=1.0).
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based), with jitter applied.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponential = base_ms * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Retry an operation, backing off between attempts.
///
/// Only errors whose [`Error::category`] is retryable are retried;
/// everything else is returned immediately. The last error is returned once
/// attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_retries + 1;
    let mut last_error = None;

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let category = err.category();
                if !category.is_retryable() {
                    debug!(%category, error = %err, "non-retryable failure");
                    return Err(err);
                }

                if attempt + 1 < attempts {
                    let delay = config.delay_for(attempt);
                    warn!(
                        %category,
                        attempt = attempt + 1,
                        remaining = attempts - attempt - 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                } else {
                    last_error = Some(err);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::other("retry loop finished without an error")))
}

/// Whether a single error would be retried by [`retry_with_backoff`].
pub fn is_retryable(error: &Error) -> bool {
    error.category().is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(5))
            .with_jitter_factor(0.0)
    }

    #[test]
    fn test_delay_growth() {
        let config = fast();
        assert!(config.delay_for(1) > config.delay_for(0));
        assert!(config.delay_for(2) > config.delay_for(1));
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_secs(30))
            .with_jitter_factor(0.0);
        assert_eq!(config.delay_for(10), config.max_delay);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_failures_then_success_counts_attempts() {
        // max_retries = k, fails k times with network, then succeeds:
        // total attempts must be k + 1.
        let k = 3;
        let config = fast().with_max_retries(k);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&config, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= k as usize {
                    Err(Error::llm(ErrorCategory::Network, "connection reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), k as usize + 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let config = fast().with_max_retries(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::llm(ErrorCategory::Network, "still down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Network);
        // Three attempts total for max_retries = 2.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::llm(ErrorCategory::Auth, "bad key")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&Error::llm(ErrorCategory::Server, "500")));
        assert!(is_retryable(&Error::llm(ErrorCategory::RateLimit, "429")));
        assert!(!is_retryable(&Error::config("bad")));
        assert!(!is_retryable(&Error::InvalidParameters("bad".into())));
    }
}
