//! Exponential backoff between failed attempts

use crate::config::RetryConfig;
use std::time::Duration;

/// Backoff schedule: `delay(n) = min(initial_delay * factor^(n-1), max_delay)`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Backoff multiplier, at least 1.0
    pub factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            factor: config.backoff_factor,
            max_delay: config.max_delay(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            factor,
            max_delay,
        }
    }

    /// Delay to wait after the `retry_count`-th failure (1-based)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry_count - 1).min(i32::MAX as u32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0) as u64).min(self.max_delay)
    }

    /// The first `count` delays of the schedule
    pub fn schedule(&self, count: u32) -> Vec<Duration> {
        (1..=count).map(|n| self.delay_for(n)).collect()
    }
}
