//! Engine facade wiring registry, queue, executor, progress, rollback and history

use super::backoff::BackoffPolicy;
use super::executor::{ExecutionReport, Executor, FailedItem, InFlight};
use super::handlers::{HandlerRegistry, OperationHandler};
use super::history::{HistoryFilter, HistoryLog, HistoryRecord, HistoryStats};
use super::progress::{ProgressSnapshot, ProgressTracker};
use super::queue::PriorityQueue;
use super::registry::{OperationRegistry, OperationStore};
use super::rollback::{
    RestoreOutcome, RestoreStrategy, RetentionPolicy, RollbackData, RollbackStore, RollbackType,
};
use super::types::{
    BatchId, HandlerRef, Operation, OperationId, OperationSpec, OperationStatus, QueueItem,
    QueueItemId, QueueItemSpec, RollbackId,
};
use crate::config::EngineConfig;
use crate::utils::error::{OpsError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Batch operation engine
pub struct OperationEngine {
    config: EngineConfig,
    registry: OperationRegistry,
    queue: Arc<PriorityQueue>,
    handlers: Arc<HandlerRegistry>,
    history: Arc<HistoryLog>,
    rollbacks: RollbackStore,
    progress: Arc<ProgressTracker>,
    executor: Arc<Executor>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationEngine {
    /// Create an engine backed by the in-memory operation store
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, OperationRegistry::new())
    }

    /// Create an engine over a caller-supplied operation store
    pub fn with_operation_store(
        config: EngineConfig,
        store: Arc<dyn OperationStore>,
    ) -> Result<Self> {
        Self::with_store(config, OperationRegistry::with_store(store))
    }

    fn with_store(config: EngineConfig, registry: OperationRegistry) -> Result<Self> {
        config.validate()?;
        if config.executor.max_concurrent > 1 {
            warn!(
                "executor.max_concurrent = {} is not honored; items run one at a time",
                config.executor.max_concurrent
            );
        }

        let queue = Arc::new(PriorityQueue::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let history = Arc::new(HistoryLog::new(config.history.capacity));
        let executor = Arc::new(Executor::new(
            registry.clone(),
            queue.clone(),
            handlers.clone(),
            history.clone(),
            BackoffPolicy::from(&config.retry),
            config.executor.idle_poll(),
        ));
        let progress = Arc::new(ProgressTracker::new(registry.clone()));
        let rollbacks = RollbackStore::new(RetentionPolicy::from(&config.rollback));
        let (shutdown, _) = watch::channel(false);

        info!(
            "Operation engine ready (history capacity {}, default max retries {})",
            config.history.capacity, config.queue.default_max_retries
        );

        Ok(Self {
            config,
            registry,
            queue,
            handlers,
            history,
            rollbacks,
            progress,
            executor,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    // ==================== Registration ====================

    pub fn register_handler(
        &self,
        handler_ref: impl Into<HandlerRef>,
        handler: Arc<dyn OperationHandler>,
    ) {
        let handler_ref = handler_ref.into();
        debug!("Registered handler {}", handler_ref);
        self.handlers.register(handler_ref, handler);
    }

    pub fn register_restore_strategy(
        &self,
        rollback_type: RollbackType,
        strategy: Arc<dyn RestoreStrategy>,
    ) {
        self.rollbacks.register_strategy(rollback_type, strategy);
    }

    pub fn register_operation(&self, spec: OperationSpec) -> Result<OperationId> {
        self.registry.register(spec)
    }

    // ==================== Enqueue ====================

    /// Enqueue one item for an operation
    pub fn enqueue(&self, operation_id: &OperationId, spec: QueueItemSpec) -> Result<QueueItemId> {
        let operation = self.accepting(operation_id)?;
        let item = self.prepare(&operation, spec, None, false)?;
        self.executor
            .admit(operation_id, vec![item])?
            .into_iter()
            .next()
            .ok_or_else(|| OpsError::internal("Enqueue produced no item"))
    }

    /// Enqueue several items as one batch
    ///
    /// Every item is validated before any is queued. With `stop_on_error`,
    /// the first exhausted item aborts whatever is left of the batch.
    pub fn enqueue_batch(
        &self,
        operation_id: &OperationId,
        specs: Vec<QueueItemSpec>,
        stop_on_error: bool,
    ) -> Result<Vec<QueueItemId>> {
        if specs.is_empty() {
            return Err(OpsError::validation("Batch must contain at least one item"));
        }
        let operation = self.accepting(operation_id)?;
        let batch_id = BatchId::new();
        let items = specs
            .into_iter()
            .map(|spec| self.prepare(&operation, spec, Some(batch_id), stop_on_error))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Enqueuing batch {} of {} item(s) for operation {}",
            batch_id,
            items.len(),
            operation_id
        );
        self.executor.admit(operation_id, items)
    }

    fn accepting(&self, operation_id: &OperationId) -> Result<Operation> {
        let operation = self.registry.get(operation_id).ok_or_else(|| {
            OpsError::validation(format!("Unknown operation {}", operation_id))
        })?;
        if operation.is_terminal() {
            return Err(OpsError::validation(format!(
                "Operation {} is {} and cannot accept new items",
                operation_id, operation.status
            )));
        }
        Ok(operation)
    }

    fn prepare(
        &self,
        operation: &Operation,
        spec: QueueItemSpec,
        batch_id: Option<BatchId>,
        stop_on_error: bool,
    ) -> Result<QueueItem> {
        let max_retries = spec
            .max_retries
            .unwrap_or(self.config.queue.default_max_retries);
        if max_retries == 0 || max_retries > self.config.queue.max_retries_limit {
            return Err(OpsError::configuration(format!(
                "max_retries must be between 1 and {}, got {}",
                self.config.queue.max_retries_limit, max_retries
            )));
        }

        let handler_ref = spec
            .handler
            .unwrap_or(HandlerRef::Operation(operation.operation_type));
        let handler = self.handlers.resolve(&handler_ref).ok_or_else(|| {
            OpsError::validation(format!("No handler registered for {}", handler_ref))
        })?;
        handler.validate(&spec.payload).map_err(|e| {
            OpsError::validation(format!("Payload rejected by {}: {}", handler_ref, e))
        })?;

        let now = Utc::now();
        Ok(QueueItem {
            id: QueueItemId::new(),
            operation_id: operation.id,
            batch_id,
            priority: spec.priority.unwrap_or(operation.priority),
            payload: spec.payload,
            retry_count: 0,
            max_retries,
            scheduled_at: spec.scheduled_at.unwrap_or(now),
            enqueued_at: now,
            handler: handler_ref,
            stop_on_error,
            sequence: 0,
        })
    }

    // ==================== Queries ====================

    pub fn get_operation(&self, id: &OperationId) -> Option<Operation> {
        self.registry.get(id)
    }

    /// All operations, oldest first
    pub fn list_operations(&self) -> Vec<Operation> {
        self.registry.list()
    }

    pub fn list_operations_by_status(&self, status: OperationStatus) -> Vec<Operation> {
        self.registry.list_by_status(status)
    }

    /// Queued items in dequeue order, ignoring schedules
    pub fn list_queue_items(&self) -> Vec<QueueItem> {
        self.queue.snapshot()
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.executor.in_flight()
    }

    /// Items that will not run again unless retried
    pub fn failed_items(&self, operation_id: &OperationId) -> Vec<FailedItem> {
        self.executor.failed_items_for(operation_id)
    }

    /// History records, oldest first
    pub fn list_history(&self) -> Vec<HistoryRecord> {
        self.history.list()
    }

    pub fn search_history(&self, filter: &HistoryFilter) -> Vec<HistoryRecord> {
        self.history.filter(filter)
    }

    pub fn latest_history(&self, n: usize) -> Vec<HistoryRecord> {
        self.history.latest(n)
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.stats()
    }

    /// Rollback checkpoints, oldest first
    pub fn list_rollbacks(&self) -> Vec<RollbackData> {
        self.rollbacks.list()
    }

    pub fn rollbacks_for(&self, operation_id: &OperationId) -> Vec<RollbackData> {
        self.rollbacks.list_for_operation(operation_id)
    }

    /// Fresh progress snapshot
    pub fn progress(&self, id: &OperationId) -> Option<ProgressSnapshot> {
        self.progress.snapshot(id)
    }

    /// Snapshots published by the periodic refresh
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    // ==================== Control ====================

    pub fn pause(&self, id: &OperationId) -> Result<Operation> {
        self.executor.pause(id)
    }

    pub fn resume(&self, id: &OperationId) -> Result<Operation> {
        self.executor.resume(id)
    }

    pub fn stop(&self, id: &OperationId) -> Result<Operation> {
        self.executor.stop(id)
    }

    /// Manually retry a failed item
    pub fn retry(&self, item_id: &QueueItemId) -> Result<QueueItemId> {
        self.executor.retry(item_id)
    }

    /// Manually retry every failed item of an operation
    pub fn retry_operation(&self, id: &OperationId) -> Result<Vec<QueueItemId>> {
        self.executor.retry_operation(id)
    }

    /// Forget an operation and any queued or failed items it still has
    pub fn remove_operation(&self, id: &OperationId) -> Result<Operation> {
        if self
            .executor
            .in_flight()
            .is_some_and(|f| f.operation_id == *id)
        {
            return Err(OpsError::validation(format!(
                "Operation {} has an item in flight; stop it first",
                id
            )));
        }
        self.executor.forget(id);
        self.registry.remove(id)
    }

    // ==================== Rollback ====================

    /// Capture a pre-image for an operation, then apply retention
    pub fn record_rollback(
        &self,
        operation_id: &OperationId,
        rollback_type: RollbackType,
        data: serde_json::Value,
        metadata: HashMap<String, String>,
    ) -> Result<RollbackId> {
        self.registry.require(operation_id)?;
        let id = self
            .rollbacks
            .record(*operation_id, rollback_type, data, metadata)?;
        self.rollbacks.cleanup(Utc::now());
        Ok(id)
    }

    /// Accept a checkpoint captured elsewhere
    pub fn import_rollback(&self, checkpoint: RollbackData) -> Result<RollbackId> {
        self.rollbacks.import(checkpoint)
    }

    pub fn verify_rollback(&self, id: &RollbackId) -> Result<bool> {
        self.rollbacks.verify(id)
    }

    pub fn delete_rollback(&self, id: &RollbackId) -> Result<RollbackData> {
        self.rollbacks.delete(id)
    }

    /// Explicitly restore a checkpoint
    pub async fn restore(&self, id: &RollbackId) -> Result<RestoreOutcome> {
        self.rollbacks.restore(id).await
    }

    // ==================== Lifecycle ====================

    /// Execute the next eligible item unless one is already running
    pub async fn process_next(&self) -> Result<Option<ExecutionReport>> {
        self.executor.process_next().await
    }

    /// Run until no eligible or scheduled work remains
    pub async fn drain(&self) -> Result<Vec<ExecutionReport>> {
        self.executor.drain().await
    }

    /// Spawn the executor run loop and the progress refresh loop
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Operation engine already started");
            return;
        }

        self.shutdown.send_replace(false);
        tasks.push(self.executor.spawn(self.shutdown.subscribe()));
        tasks.push(
            self.progress
                .clone()
                .spawn(self.config.progress.refresh_interval(), self.shutdown.subscribe()),
        );
        info!("Operation engine started");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Stop background loops; an in-flight item is allowed to finish
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Operation engine stopped");
    }
}
