//! Generic exponential-backoff retry, pulled out so both the storage layer (baseline
//! queries under lock contention) and the startup protocol (port-conflict losers) can
//! share one implementation.

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 25,
            max_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}

/// Runs `f` up to `config.max_retries + 1` times, retrying only while `is_retryable`
/// returns true for the error and attempts remain. Returns the last error otherwise.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && is_retryable(&e) => {
                let delay = config.calculate_delay(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient error, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let result: Result<u32, &str> = with_retry(&config, "test", |_e: &&str| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("busy")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let config = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let result: Result<u32, &str> =
            with_retry(&config, "test", |_e: &&str| true, || async { Err("busy") }).await;
        assert_eq!(result, Err("busy"));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&config, "test", |_e: &&str| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal") }
        })
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
