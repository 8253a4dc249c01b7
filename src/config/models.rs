//! Engine configuration sections

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts per item when the enqueue request does not say
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Upper bound accepted for a per-item `max_retries`
    #[serde(default = "default_max_retries_limit")]
    pub max_retries_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            max_retries_limit: default_max_retries_limit(),
        }
    }
}

/// Exponential backoff between failed attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per further attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Cap on any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// History log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Records retained before the oldest is evicted
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

/// Rollback checkpoint retention; unset bounds are not enforced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub max_entries: Option<usize>,
}

impl RollbackConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// Progress tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl ProgressConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Accepted for forward compatibility; execution is always serial
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Longest the run loop sleeps without a wake-up
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_retries_limit() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_history_capacity() -> usize {
    1000
}

fn default_refresh_interval_ms() -> u64 {
    2000
}

fn default_max_concurrent() -> usize {
    1
}

fn default_idle_poll_ms() -> u64 {
    500
}
