//! Configuration for the sync engine.

use geode_core::StoreConfig;
use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of items per batch.
    pub batch_size: usize,
    /// Maximum number of batches per sync cycle.
    pub max_batches_per_cycle: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Local store configuration.
    pub store: StoreConfig,
    /// Whether a cycle ends with an eviction pass against the store budget.
    pub evict_after_cycle: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            max_batches_per_cycle: 16,
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            evict_after_cycle: true,
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the maximum number of batches per cycle.
    pub fn with_max_batches_per_cycle(mut self, batches: usize) -> Self {
        self.max_batches_per_cycle = batches.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets whether cycles end with an eviction pass.
    pub fn with_evict_after_cycle(mut self, evict: bool) -> Self {
        self.evict_after_cycle = evict;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Default share of the delay added as random jitter.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Back-off schedule for transient failures.
///
/// Retry `n` waits `initial_delay * multiplier^(n - 1)`, capped at
/// `max_delay`, plus a random extra of up to `jitter` times that delay.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which an entry is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Jitter as a share of the delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryConfig {
    /// Creates a schedule that dead-letters after `max_attempts` failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Creates a schedule that dead-letters on the first counted failure.
    pub fn no_retry() -> Self {
        Self::new(1).with_jitter(false)
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the cap on the un-jittered delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor. Values below 1 are raised to 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Turns the default jitter on or off.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = if enabled { DEFAULT_JITTER } else { 0.0 };
        self
    }

    /// Sets the jitter share, clamped to `0.0..=1.0`.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Returns the wait before retry number `attempt`; zero for the first try.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let extra = if self.jitter > 0.0 {
            capped * self.jitter * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        Duration::try_from_secs_f64(capped + extra).unwrap_or(Duration::MAX)
    }

    /// Returns the time (ms since epoch) at which an entry that has failed
    /// `attempt` times becomes ready again.
    pub fn retry_at(&self, now_ms: u64, attempt: u32) -> u64 {
        let delay = self.delay_for_attempt(attempt).as_millis();
        now_ms.saturating_add(u64::try_from(delay).unwrap_or(u64::MAX))
    }

    /// Returns true once `attempt` failures exhaust the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}
