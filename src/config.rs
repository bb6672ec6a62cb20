//! Configuration types for the shard-map manager.

use std::time::Duration;

/// Main configuration for a [`ShardMapManager`](crate::ShardMapManager).
#[derive(Debug, Clone, Default)]
pub struct ShardMapManagerConfig {
    /// Cache staleness-clock parameters.
    pub cache_ttl: CacheTtlConfig,

    /// Retry policy for transient store faults.
    pub retry: RetryConfig,
}

impl ShardMapManagerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache TTL parameters.
    pub fn with_cache_ttl(mut self, cache_ttl: CacheTtlConfig) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Set the retry policy parameters.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Time-to-live parameters for cached mappings.
///
/// A freshly cached mapping starts at `initial`; every successful
/// re-validation against the store doubles the window up to `ceiling`,
/// backing off re-queries for hot, rarely-changing mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtlConfig {
    /// TTL assigned to a newly cached mapping.
    pub initial: Duration,
    /// Upper bound the TTL never grows past.
    pub ceiling: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(5_000),
            ceiling: Duration::from_millis(30_000),
        }
    }
}

impl CacheTtlConfig {
    /// Create TTL parameters with explicit bounds.
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self { initial, ceiling }
    }

    /// The next TTL after a successful re-validation: doubled, capped at
    /// the ceiling.
    pub fn grow(&self, current: Duration) -> Duration {
        (current * 2).min(self.ceiling)
    }
}

/// Retry policy parameters for transient store faults.
///
/// Exponential backoff with jitter, bounded attempt count. Non-transient
/// faults are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a retry configuration.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never waits and retries only once more, for tests.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_growth_doubles_and_caps() {
        let ttl = CacheTtlConfig::default();
        let d1 = ttl.grow(ttl.initial);
        assert_eq!(d1, Duration::from_millis(10_000));
        let d2 = ttl.grow(d1);
        assert_eq!(d2, Duration::from_millis(20_000));
        let d3 = ttl.grow(d2);
        assert_eq!(d3, Duration::from_millis(30_000));
        // Stays pinned at the ceiling.
        assert_eq!(ttl.grow(d3), Duration::from_millis(30_000));
    }

    #[test]
    fn builder_chains() {
        let cfg = ShardMapManagerConfig::new()
            .with_retry(RetryConfig::fast())
            .with_cache_ttl(CacheTtlConfig::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
            ));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.cache_ttl.initial, Duration::from_millis(10));
    }
}
