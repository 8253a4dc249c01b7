//! Configuration management for the engine
//!
//! Settings load from YAML, from `BATCH_OPS_*` environment variables, or both
//! (file first, environment on top), and are validated before use.

pub mod models;
pub mod validation;

pub use models::*;
pub use validation::Validate;

use crate::utils::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "BATCH_OPS_";

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {:?}", path);

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            OpsError::configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config = Self::from_yaml(&content)?;
        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| OpsError::configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `BATCH_OPS_*` environment variables
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment variables");
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, keyed by full variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        override_with(&var, "DEFAULT_MAX_RETRIES", &mut self.queue.default_max_retries)?;
        override_with(&var, "MAX_RETRIES_LIMIT", &mut self.queue.max_retries_limit)?;
        override_with(&var, "RETRY_INITIAL_DELAY_MS", &mut self.retry.initial_delay_ms)?;
        override_with(&var, "RETRY_BACKOFF_FACTOR", &mut self.retry.backoff_factor)?;
        override_with(&var, "RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        override_with(&var, "HISTORY_CAPACITY", &mut self.history.capacity)?;
        override_optional(&var, "ROLLBACK_MAX_AGE_SECS", &mut self.rollback.max_age_secs)?;
        override_optional(&var, "ROLLBACK_MAX_ENTRIES", &mut self.rollback.max_entries)?;
        override_with(&var, "PROGRESS_REFRESH_MS", &mut self.progress.refresh_interval_ms)?;
        override_with(&var, "MAX_CONCURRENT", &mut self.executor.max_concurrent)?;
        override_with(&var, "IDLE_POLL_MS", &mut self.executor.idle_poll_ms)?;
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        debug!("Validating configuration");

        let sections: [(&str, &dyn Validate); 6] = [
            ("Queue", &self.queue),
            ("Retry", &self.retry),
            ("History", &self.history),
            ("Rollback", &self.rollback),
            ("Progress", &self.progress),
            ("Executor", &self.executor),
        ];
        for (name, section) in sections {
            section
                .validate()
                .map_err(|e| OpsError::configuration(format!("{} config error: {}", name, e)))?;
        }

        debug!("Configuration validation completed");
        Ok(())
    }

    /// Convert to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            OpsError::configuration(format!("Failed to serialize config to YAML: {}", e))
        })
    }
}

fn override_with<T, F>(var: &F, name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = parse_var(name, &raw)?;
    }
    Ok(())
}

fn override_optional<T, F>(var: &F, name: &str, target: &mut Option<T>) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *target = if raw.trim().is_empty() {
            None
        } else {
            Some(parse_var(name, &raw)?)
        };
    }
    Ok(())
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        OpsError::configuration(format!(
            "Invalid value '{}' for {}{}: {}",
            raw, ENV_PREFIX, name, e
        ))
    })
}
