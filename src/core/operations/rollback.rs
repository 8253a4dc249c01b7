//! Rollback checkpoints
//!
//! Callers record a pre-image before running destructive work. Restoration is
//! always an explicit request: the stored snapshot is re-verified against its
//! checksum and then handed to the strategy registered for its type.

use super::types::{OperationId, RollbackId};
use crate::config::RollbackConfig;
use crate::utils::error::{OpsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Kind of state a checkpoint captures
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    Database,
    File,
    System,
    /// Application-defined checkpoint kind
    Custom(String),
}

impl fmt::Display for RollbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackType::Database => f.write_str("database"),
            RollbackType::File => f.write_str("file"),
            RollbackType::System => f.write_str("system"),
            RollbackType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// A captured pre-image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackData {
    pub id: RollbackId,
    pub operation_id: OperationId,
    pub rollback_type: RollbackType,
    pub data: serde_json::Value,
    /// Hex SHA-256 of the canonical JSON encoding of `data`
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl RollbackData {
    /// Whether `data` still matches `checksum`
    pub fn verify(&self) -> Result<bool> {
        Ok(compute_checksum(&self.data)? == self.checksum)
    }
}

/// Checksum over the canonical JSON encoding of a snapshot
pub fn compute_checksum(data: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Result of a successful restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub rollback_id: RollbackId,
    pub operation_id: OperationId,
    pub rollback_type: RollbackType,
    pub restored_at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Type-specific restoration logic
#[async_trait]
pub trait RestoreStrategy: Send + Sync {
    /// Re-apply the snapshot; an error leaves the external state to the strategy
    async fn restore(&self, checkpoint: &RollbackData) -> Result<Option<String>>;
}

/// Retention bounds; unset bounds are not enforced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_entries: Option<usize>,
}

impl From<&RollbackConfig> for RetentionPolicy {
    fn from(config: &RollbackConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_entries: config.max_entries,
        }
    }
}

/// Store of rollback checkpoints
pub struct RollbackStore {
    entries: DashMap<RollbackId, RollbackData>,
    strategies: RwLock<HashMap<RollbackType, Arc<dyn RestoreStrategy>>>,
    retention: RetentionPolicy,
}

impl RollbackStore {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            strategies: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Register the restoration strategy for a checkpoint type
    pub fn register_strategy(
        &self,
        rollback_type: RollbackType,
        strategy: Arc<dyn RestoreStrategy>,
    ) {
        debug!("Registered restore strategy for {}", rollback_type);
        self.strategies.write().insert(rollback_type, strategy);
    }

    /// Capture a checkpoint for `operation_id`
    pub fn record(
        &self,
        operation_id: OperationId,
        rollback_type: RollbackType,
        data: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Result<RollbackId> {
        let checksum = compute_checksum(&data)?;
        let checkpoint = RollbackData {
            id: RollbackId::new(),
            operation_id,
            rollback_type,
            data,
            checksum,
            created_at: Utc::now(),
            metadata,
        };

        let id = checkpoint.id;
        info!(
            "Recorded {} rollback checkpoint {} for operation {}",
            checkpoint.rollback_type, id, operation_id
        );
        self.entries.insert(id, checkpoint);
        Ok(id)
    }

    /// Accept a checkpoint captured elsewhere as-is
    ///
    /// The checksum is not recomputed; it is verified when the checkpoint is
    /// restored.
    pub fn import(&self, checkpoint: RollbackData) -> Result<RollbackId> {
        if self.entries.contains_key(&checkpoint.id) {
            return Err(OpsError::validation(format!(
                "Rollback checkpoint {} already exists",
                checkpoint.id
            )));
        }
        let id = checkpoint.id;
        self.entries.insert(id, checkpoint);
        Ok(id)
    }

    pub fn get(&self, id: &RollbackId) -> Option<RollbackData> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// All checkpoints, oldest first
    pub fn list(&self) -> Vec<RollbackData> {
        let mut all: Vec<RollbackData> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn list_for_operation(&self, operation_id: &OperationId) -> Vec<RollbackData> {
        self.list()
            .into_iter()
            .filter(|c| c.operation_id == *operation_id)
            .collect()
    }

    /// Explicit removal by the user
    pub fn delete(&self, id: &RollbackId) -> Result<RollbackData> {
        self.entries
            .remove(id)
            .map(|(_, checkpoint)| checkpoint)
            .ok_or_else(|| OpsError::not_found(format!("Rollback checkpoint {} not found", id)))
    }

    /// Whether the stored snapshot still matches its checksum
    pub fn verify(&self, id: &RollbackId) -> Result<bool> {
        self.get(id)
            .ok_or_else(|| OpsError::not_found(format!("Rollback checkpoint {} not found", id)))?
            .verify()
    }

    /// Restore a checkpoint through the strategy registered for its type
    pub async fn restore(&self, id: &RollbackId) -> Result<RestoreOutcome> {
        let checkpoint = self
            .get(id)
            .ok_or_else(|| OpsError::not_found(format!("Rollback checkpoint {} not found", id)))?;

        if !checkpoint.verify()? {
            error!(
                "Refusing to restore checkpoint {}: checksum mismatch",
                checkpoint.id
            );
            return Err(OpsError::rollback(format!(
                "Checksum mismatch for checkpoint {}; snapshot is corrupted or was tampered with",
                checkpoint.id
            )));
        }

        let strategy = self
            .strategies
            .read()
            .get(&checkpoint.rollback_type)
            .cloned()
            .ok_or_else(|| {
                OpsError::rollback(format!(
                    "No restore strategy registered for {} checkpoints",
                    checkpoint.rollback_type
                ))
            })?;

        info!(
            "Restoring {} checkpoint {} for operation {}",
            checkpoint.rollback_type, checkpoint.id, checkpoint.operation_id
        );

        let detail = strategy.restore(&checkpoint).await.map_err(|e| {
            error!("Restore of checkpoint {} failed: {}", checkpoint.id, e);
            match e {
                OpsError::Rollback(message) => OpsError::Rollback(message),
                other => OpsError::rollback(format!(
                    "Restore of checkpoint {} failed: {}",
                    checkpoint.id, other
                )),
            }
        })?;

        Ok(RestoreOutcome {
            rollback_id: checkpoint.id,
            operation_id: checkpoint.operation_id,
            rollback_type: checkpoint.rollback_type,
            restored_at: Utc::now(),
            detail,
        })
    }

    /// Apply the retention policy, oldest first; returns the number removed
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;

        if let Some(max_age) = self.retention.max_age {
            match chrono::Duration::from_std(max_age) {
                Ok(max_age) => {
                    let cutoff = now - max_age;
                    let expired: Vec<RollbackId> = self
                        .entries
                        .iter()
                        .filter(|e| e.value().created_at < cutoff)
                        .map(|e| *e.key())
                        .collect();
                    for id in expired {
                        if self.entries.remove(&id).is_some() {
                            removed += 1;
                        }
                    }
                }
                Err(e) => warn!("Ignoring out-of-range rollback max_age: {}", e),
            }
        }

        if let Some(max_entries) = self.retention.max_entries {
            let all = self.list();
            if all.len() > max_entries {
                for checkpoint in &all[..all.len() - max_entries] {
                    if self.entries.remove(&checkpoint.id).is_some() {
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            info!("Rollback retention removed {} checkpoint(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
