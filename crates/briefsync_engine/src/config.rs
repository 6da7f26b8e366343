//! Configuration for the briefcase manager.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size above which change-sets are applied off the caller's task.
pub const DEFAULT_ASYNC_APPLY_THRESHOLD: u64 = 1024 * 1024;

/// Default number of pending code reconciliations handled per sweep.
pub const DEFAULT_RECONCILE_BATCH_LIMIT: usize = 100;

/// Configuration for a `BriefcaseManager`.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the local cache.
    pub cache_dir: PathBuf,
    /// Largest change-set file (bytes) still applied on the synchronous path.
    pub async_apply_threshold: u64,
    /// Retry policy for pushes.
    pub push_retry: RetryConfig,
    /// Pending code reconciliations handled per sweep.
    pub reconcile_batch_limit: usize,
    /// Whether pulls rebase local schema and data transactions semantically.
    pub semantic_rebase: bool,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl ManagerConfig {
    /// Creates a configuration rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            async_apply_threshold: DEFAULT_ASYNC_APPLY_THRESHOLD,
            push_retry: RetryConfig::default(),
            reconcile_batch_limit: DEFAULT_RECONCILE_BATCH_LIMIT,
            semantic_rebase: false,
            event_capacity: 64,
        }
    }

    /// Sets the async apply threshold.
    pub fn with_async_apply_threshold(mut self, bytes: u64) -> Self {
        self.async_apply_threshold = bytes;
        self
    }

    /// Sets the push retry policy.
    pub fn with_push_retry(mut self, retry: RetryConfig) -> Self {
        self.push_retry = retry;
        self
    }

    /// Sets the reconciliation batch limit.
    pub fn with_reconcile_batch_limit(mut self, limit: usize) -> Self {
        self.reconcile_batch_limit = limit.max(1);
        self
    }

    /// Enables or disables semantic rebase.
    pub fn with_semantic_rebase(mut self, enabled: bool) -> Self {
        self.semantic_rebase = enabled;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Returns the cache root.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Retry behavior for contended pushes.
///
/// Delays are drawn uniformly from `[min_delay, max_delay)` so competing
/// pushers drift apart instead of colliding again.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Lower bound of the random delay.
    pub min_delay: Duration,
    /// Upper bound (exclusive) of the random delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a configuration with `max_attempts` and the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::new(1).with_delays(Duration::ZERO, Duration::ZERO)
    }

    /// Sets both delay bounds.
    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }

    /// Draws the delay before the next attempt.
    pub fn random_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if max <= min {
            return self.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
