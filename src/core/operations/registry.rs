//! Operation registry
//!
//! The registry is the single source of truth for operation state. Every
//! mutation goes through [`OperationRegistry::update`], which applies the change
//! to a private copy, validates it, and only then swaps it into the store, so
//! readers never observe a half-written operation.

use super::types::{Operation, OperationId, OperationSpec, OperationStatus, ProgressPhase};
use crate::utils::error::{OpsError, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage backend for operations
///
/// Implementations must apply `update` atomically with respect to readers.
pub trait OperationStore: Send + Sync {
    fn insert(&self, operation: Operation) -> Result<()>;

    fn get(&self, id: &OperationId) -> Option<Operation>;

    fn list(&self) -> Vec<Operation>;

    /// Apply `mutation` to a copy of the stored operation and replace the
    /// original only if the mutation succeeds
    fn update(
        &self,
        id: &OperationId,
        mutation: &mut dyn FnMut(&mut Operation) -> Result<()>,
    ) -> Result<Operation>;

    fn remove(&self, id: &OperationId) -> Option<Operation>;
}

/// Default in-process store
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<HashMap<OperationId, Operation>>,
}

impl OperationStore for InMemoryOperationStore {
    fn insert(&self, operation: Operation) -> Result<()> {
        let mut operations = self.operations.write();
        if operations.contains_key(&operation.id) {
            return Err(OpsError::validation(format!(
                "Operation {} already exists",
                operation.id
            )));
        }
        operations.insert(operation.id, operation);
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Option<Operation> {
        self.operations.read().get(id).cloned()
    }

    fn list(&self) -> Vec<Operation> {
        self.operations.read().values().cloned().collect()
    }

    fn update(
        &self,
        id: &OperationId,
        mutation: &mut dyn FnMut(&mut Operation) -> Result<()>,
    ) -> Result<Operation> {
        let mut operations = self.operations.write();
        let current = operations
            .get(id)
            .ok_or_else(|| OpsError::not_found(format!("Operation {} not found", id)))?;

        let mut next = current.clone();
        mutation(&mut next)?;
        operations.insert(*id, next.clone());
        Ok(next)
    }

    fn remove(&self, id: &OperationId) -> Option<Operation> {
        self.operations.write().remove(id)
    }
}

/// Registry of every tracked operation
#[derive(Clone)]
pub struct OperationRegistry {
    store: Arc<dyn OperationStore>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// Create a registry backed by the in-memory store
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryOperationStore::default()))
    }

    /// Create a registry backed by a custom store
    pub fn with_store(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }

    /// Register a new operation in `pending` state
    pub fn register(&self, spec: OperationSpec) -> Result<OperationId> {
        if spec.title.trim().is_empty() {
            return Err(OpsError::validation("Operation title cannot be empty"));
        }

        let now = Utc::now();
        let operation = Operation {
            id: OperationId::new(),
            operation_type: spec.operation_type,
            title: spec.title,
            description: spec.description,
            priority: spec.priority,
            status: OperationStatus::Pending,
            total_items: spec.total_items.unwrap_or(0),
            processed_items: 0,
            success_items: 0,
            failed_items: 0,
            progress: 0.0,
            attempts: 0,
            cycle: 1,
            phases: spec.phases.into_iter().map(ProgressPhase::new).collect(),
            created_by: spec.created_by.unwrap_or_else(|| "system".to_string()),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            payload: spec.payload,
            tags: spec.tags,
            total_from_items: spec.total_items.is_none(),
        };

        let id = operation.id;
        info!(
            "Registered operation {} ({}, priority {}): {}",
            id, operation.operation_type, operation.priority, operation.title
        );
        self.store.insert(operation)?;
        Ok(id)
    }

    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.store.get(id)
    }

    /// Like [`get`](Self::get), but a missing operation is an error
    pub fn require(&self, id: &OperationId) -> Result<Operation> {
        self.store
            .get(id)
            .ok_or_else(|| OpsError::not_found(format!("Operation {} not found", id)))
    }

    pub fn status(&self, id: &OperationId) -> Option<OperationStatus> {
        self.store.get(id).map(|op| op.status)
    }

    /// All operations, oldest first
    pub fn list(&self) -> Vec<Operation> {
        let mut operations = self.store.list();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        operations
    }

    pub fn list_by_status(&self, status: OperationStatus) -> Vec<Operation> {
        self.list()
            .into_iter()
            .filter(|op| op.status == status)
            .collect()
    }

    /// Atomically mutate an operation
    ///
    /// The mutation runs against a copy. The copy is rejected if it breaks the
    /// state machine or the counter invariants, in which case the stored
    /// operation is left untouched.
    pub fn update<F>(&self, id: &OperationId, mutation: F) -> Result<Operation>
    where
        F: FnOnce(&mut Operation) -> Result<()>,
    {
        let mut mutation = Some(mutation);
        self.store.update(id, &mut |op: &mut Operation| {
            let before = op.status;
            let apply = mutation
                .take()
                .ok_or_else(|| OpsError::internal("Operation mutation applied twice"))?;
            apply(op)?;
            validate_update(op, before)?;
            op.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Move an operation to `next` if the state machine allows it
    pub fn transition(&self, id: &OperationId, next: OperationStatus) -> Result<Operation> {
        let operation = self.update(id, |op| {
            op.status = next;
            Ok(())
        })?;
        debug!("Operation {} is now {}", id, next);
        Ok(operation)
    }

    /// Set the progress of a named phase; 100% marks the phase complete
    pub fn advance_phase(&self, id: &OperationId, phase: &str, progress: f64) -> Result<Operation> {
        if !progress.is_finite() {
            return Err(OpsError::validation("Phase progress must be a finite number"));
        }

        self.update(id, |op| {
            let entry = op
                .phases
                .iter_mut()
                .find(|p| p.name == phase)
                .ok_or_else(|| {
                    OpsError::validation(format!("Operation has no phase named '{}'", phase))
                })?;

            entry.progress = progress.clamp(0.0, 100.0);
            entry.completed_at = if entry.progress >= 100.0 {
                entry.completed_at.or_else(|| Some(Utc::now()))
            } else {
                None
            };
            Ok(())
        })
    }

    pub fn remove(&self, id: &OperationId) -> Result<Operation> {
        let removed = self
            .store
            .remove(id)
            .ok_or_else(|| OpsError::not_found(format!("Operation {} not found", id)))?;
        info!("Removed operation {}", id);
        Ok(removed)
    }
}

fn validate_update(op: &Operation, before: OperationStatus) -> Result<()> {
    if !before.can_transition_to(op.status) {
        return Err(OpsError::InvalidTransition {
            id: op.id.to_string(),
            from: before,
            to: op.status,
        });
    }

    if op.processed_items > op.total_items {
        return Err(OpsError::internal(format!(
            "Operation {} processed {} of {} items",
            op.id, op.processed_items, op.total_items
        )));
    }

    if op.success_items + op.failed_items > op.processed_items {
        return Err(OpsError::internal(format!(
            "Operation {} has more outcomes than processed items",
            op.id
        )));
    }

    Ok(())
}
