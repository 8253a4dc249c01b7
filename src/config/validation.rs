//! Configuration validation

use super::models::*;

/// Validation trait for configuration structures
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

impl Validate for QueueConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_retries_limit == 0 {
            return Err("queue.max_retries_limit must be at least 1".to_string());
        }
        if self.default_max_retries == 0 {
            return Err("queue.default_max_retries must be at least 1".to_string());
        }
        if self.default_max_retries > self.max_retries_limit {
            return Err(format!(
                "queue.default_max_retries ({}) exceeds queue.max_retries_limit ({})",
                self.default_max_retries, self.max_retries_limit
            ));
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "retry.backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "retry.max_delay_ms ({}) is smaller than retry.initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        Ok(())
    }
}

impl Validate for HistoryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("history.capacity must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Validate for RollbackConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_age_secs == Some(0) {
            return Err("rollback.max_age_secs must be positive when set".to_string());
        }
        if self.max_entries == Some(0) {
            return Err("rollback.max_entries must be positive when set".to_string());
        }
        Ok(())
    }
}

impl Validate for ProgressConfig {
    fn validate(&self) -> Result<(), String> {
        if self.refresh_interval_ms == 0 {
            return Err("progress.refresh_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

impl Validate for ExecutorConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("executor.max_concurrent must be at least 1".to_string());
        }
        if self.idle_poll_ms == 0 {
            return Err("executor.idle_poll_ms must be positive".to_string());
        }
        Ok(())
    }
}
