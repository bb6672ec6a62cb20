//! Retry policy for transient store faults.
//!
//! Exponential backoff with jitter and a bounded attempt count, wrapping
//! each per-step unit of work. Only [`Error::is_transient`] faults are
//! retried; domain conflicts and terminal transport faults pass straight
//! through. Exhausting the budget surfaces the last transient fault as a
//! [`ShardManagementErrorCode::RetriesExhausted`] management error.

use crate::config::RetryConfig;
use crate::error::{Error, ErrorCategory, Result, ShardManagementErrorCode};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Retry executor shared by every operation instance.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from its configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before the given retry (1-based), with jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.config.max_delay);
        let jitter_ceiling = (capped.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        capped + Duration::from_millis(jitter)
    }

    /// Run one unit of work, retrying transient faults.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut unit: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match unit().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store fault, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(Error::shard_management(
                        ErrorCategory::General,
                        ShardManagementErrorCode::RetriesExhausted,
                        operation,
                        format!("{attempt} attempts failed, last fault: {err}"),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::fast())
    }

    #[tokio::test]
    async fn transient_faults_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run("unit", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Transient("deadlock".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_faults_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy()
            .run("unit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Store("schema missing".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_management_error() {
        let calls = AtomicU32::new(0);
        let err = fast_policy()
            .run("unit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Transient("timeout".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.management_code(),
            Some(ShardManagementErrorCode::RetriesExhausted)
        );
        assert_eq!(calls.load(Ordering::SeqCst), RetryConfig::fast().max_attempts);
    }
}
