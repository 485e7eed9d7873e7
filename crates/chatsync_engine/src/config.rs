//! Configuration for the synchronization engine.

use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long an inbound typing signal stays true without a refresh.
    pub typing_expiry: Duration,
    /// Reconnect policy for channel sessions.
    pub reconnect: RetryConfig,
    /// Deadline for each deduplicated request attempt.
    pub request_timeout: Duration,
    /// Retry policy for deduplicated reads and best-effort writes.
    pub request_retry: RetryConfig,
    /// Rate limiting for bursts of identical requests.
    pub rate_limit: RateLimitConfig,
    /// Batch accumulation policy.
    pub batch: BatchConfig,
    /// Capacity of the internal event queue between session and consumer.
    pub event_queue_capacity: usize,
}

impl SyncConfig {
    /// Sets the typing expiry window.
    pub fn with_typing_expiry(mut self, expiry: Duration) -> Self {
        self.typing_expiry = expiry;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the request retry policy.
    pub fn with_request_retry(mut self, retry: RetryConfig) -> Self {
        self.request_retry = retry;
        self
    }

    /// Sets the rate-limit policy.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the batch policy.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_secs(3),
            // Reconnect delays stay deterministic so the backoff cadence is
            // observable; request retries keep jitter.
            reconnect: RetryConfig::new(5)
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30))
                .without_jitter(),
            request_timeout: Duration::from_secs(10),
            request_retry: RetryConfig::new(3),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            event_queue_capacity: 64,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    ///
    /// Attempt 0 never waits. Delays double (by the configured multiplier)
    /// per attempt and are capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = capped * 0.25 * pseudo_jitter();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Rate limiting for bursts of identical requests.
///
/// A key invoked more than `threshold` times within one `window` gets an
/// artificial `delay` before each further issue, smoothing rapid UI
/// interactions into something the backend tolerates.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Calls allowed per key within the window before throttling starts.
    pub threshold: u32,
    /// Length of the counting window.
    pub window: Duration,
    /// Artificial delay once the threshold is exceeded.
    pub delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(1),
            delay: Duration::from_millis(200),
        }
    }
}

/// Batch accumulation policy.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long a batch accumulates before flushing.
    pub window: Duration,
    /// Flush immediately once this many calls have accumulated.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(50),
            max_size: 10,
        }
    }
}

/// Cheap time-derived jitter (no RNG dependency).
fn pseudo_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_product_behavior() {
        let config = SyncConfig::default();
        assert_eq!(config.typing_expiry, Duration::from_secs(3));
        assert_eq!(config.rate_limit.window, Duration::from_secs(1));
        assert!(config.reconnect.max_attempts > 1);
    }

    #[test]
    fn config_builder() {
        let config = SyncConfig::default()
            .with_typing_expiry(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(config.typing_expiry, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }

    #[test]
    fn no_retry_makes_one_attempt() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(4))
            .without_jitter();

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
        // Capped from here on.
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let retry = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));

        let delay = retry.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }
}
