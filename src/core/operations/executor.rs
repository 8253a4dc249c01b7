//! Single-flight executor
//!
//! All handler invocations are serialized: an async guard is held for the whole
//! of every attempt, so at most one item is in flight no matter how many
//! callers trigger processing. Failed attempts are re-enqueued with an
//! exponential backoff encoded in the item's `scheduled_at`; exhausted items
//! are parked in a dead-letter table from which they can be retried manually.

use super::backoff::BackoffPolicy;
use super::handlers::{HandlerContext, HandlerError, HandlerOutput, HandlerRegistry};
use super::history::{HistoryLog, HistoryRecord};
use super::queue::PriorityQueue;
use super::registry::OperationRegistry;
use super::types::{Operation, OperationId, OperationStatus, QueueItem, QueueItemId};
use crate::utils::error::{OpsError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The item currently being executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlight {
    pub item_id: QueueItemId,
    pub operation_id: OperationId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// An item that will not run again unless retried manually
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: QueueItem,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// Whether the item was counted in the operation's processed/failed counters
    pub counted: bool,
}

/// What happened to a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    RetryScheduled { delay: Duration },
    /// Retries are used up; the item was parked as failed
    Exhausted,
    /// The attempt's result was discarded (operation stopped or removed)
    Abandoned,
}

/// Summary of one executed item
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub item_id: QueueItemId,
    pub operation_id: OperationId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Set when this attempt moved the operation into a terminal state
    pub terminal: Option<OperationStatus>,
}

/// Serial run loop over the priority queue
pub struct Executor {
    registry: OperationRegistry,
    queue: Arc<PriorityQueue>,
    handlers: Arc<HandlerRegistry>,
    history: Arc<HistoryLog>,
    backoff: BackoffPolicy,
    idle_poll: Duration,
    /// Held for the whole of an attempt
    guard: tokio::sync::Mutex<()>,
    /// Serializes dequeue, settlement and control-plane changes
    lifecycle: Mutex<()>,
    in_flight: Mutex<Option<InFlight>>,
    failed: Mutex<HashMap<QueueItemId, FailedItem>>,
    cancellations: DashMap<OperationId, Arc<AtomicBool>>,
    wake: Notify,
}

impl Executor {
    pub fn new(
        registry: OperationRegistry,
        queue: Arc<PriorityQueue>,
        handlers: Arc<HandlerRegistry>,
        history: Arc<HistoryLog>,
        backoff: BackoffPolicy,
        idle_poll: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            handlers,
            history,
            backoff,
            idle_poll,
            guard: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(()),
            in_flight: Mutex::new(None),
            failed: Mutex::new(HashMap::new()),
            cancellations: DashMap::new(),
            wake: Notify::new(),
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Nudge the run loop; called after anything that may make work eligible
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight.lock().clone()
    }

    /// Parked items, oldest enqueue first
    pub fn failed_items(&self) -> Vec<FailedItem> {
        let mut items: Vec<FailedItem> = self.failed.lock().values().cloned().collect();
        items.sort_by_key(|f| f.item.sequence);
        items
    }

    pub fn failed_items_for(&self, operation_id: &OperationId) -> Vec<FailedItem> {
        self.failed_items()
            .into_iter()
            .filter(|f| f.item.operation_id == *operation_id)
            .collect()
    }

    pub fn is_cancelled(&self, operation_id: &OperationId) -> bool {
        self.cancellations
            .get(operation_id)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    fn cancellation_flag(&self, operation_id: &OperationId) -> Arc<AtomicBool> {
        self.cancellations
            .entry(*operation_id)
            .or_default()
            .value()
            .clone()
    }

    fn is_eligible(&self, item: &QueueItem) -> bool {
        if self.is_cancelled(&item.operation_id) {
            return false;
        }
        self.registry
            .status(&item.operation_id)
            .is_none_or(|status| status.accepts_work())
    }

    /// Execute the next eligible item unless an attempt is already running
    ///
    /// Returns `Ok(None)` when the executor is busy or nothing is eligible.
    pub async fn process_next(&self) -> Result<Option<ExecutionReport>> {
        let Ok(_guard) = self.guard.try_lock() else {
            debug!("Executor busy, trigger ignored");
            return Ok(None);
        };
        self.dispatch_next().await
    }

    /// Process items until nothing eligible is queued or scheduled
    ///
    /// Sleeps through backoff delays. Items of paused or stopped operations
    /// are left in the queue.
    pub async fn drain(&self) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::new();
        loop {
            let report = {
                let _guard = self.guard.lock().await;
                self.dispatch_next().await?
            };
            if let Some(report) = report {
                reports.push(report);
                continue;
            }

            match self.queue.next_scheduled_at(|item| self.is_eligible(item)) {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!("Waiting {:?} for the next scheduled retry", wait);
                    tokio::time::sleep(wait).await;
                }
                None => break,
            }
        }
        Ok(reports)
    }

    /// Long-lived run loop; exits when `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Executor run loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = {
                let _guard = self.guard.lock().await;
                self.dispatch_next().await
            };
            match processed {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!("Executor iteration failed: {}", e),
            }

            let wait = self
                .queue
                .next_scheduled_at(|item| self.is_eligible(item))
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.idle_poll)
                .min(self.idle_poll);

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Executor run loop stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    async fn dispatch_next(&self) -> Result<Option<ExecutionReport>> {
        let item = {
            let _lifecycle = self.lifecycle.lock();
            let Some(item) = self
                .queue
                .dequeue_eligible(Utc::now(), |item| self.is_eligible(item))
            else {
                return Ok(None);
            };
            *self.in_flight.lock() = Some(InFlight {
                item_id: item.id,
                operation_id: item.operation_id,
                attempt: item.attempt(),
                started_at: Utc::now(),
            });
            item
        };

        let result = self.run_attempt(item).await;
        *self.in_flight.lock() = None;

        let report = result?;
        let terminal = self.settle(&report.operation_id)?;
        Ok(Some(ExecutionReport { terminal, ..report }))
    }

    async fn run_attempt(&self, item: QueueItem) -> Result<ExecutionReport> {
        let operation_id = item.operation_id;
        let attempt = item.attempt();
        let report = |outcome| ExecutionReport {
            item_id: item.id,
            operation_id,
            attempt,
            outcome,
            terminal: None,
        };

        let started_at = Utc::now();
        let started = self.registry.update(&operation_id, |op| {
            if op.status == OperationStatus::Pending {
                op.status = OperationStatus::Running;
            }
            if op.started_at.is_none() {
                op.started_at = Some(started_at);
            }
            op.attempts += 1;
            Ok(())
        });
        match started {
            Ok(_) => {}
            Err(OpsError::NotFound(_)) => {
                warn!(
                    "Dropping item {}: operation {} no longer exists",
                    item.id, operation_id
                );
                return Ok(report(AttemptOutcome::Abandoned));
            }
            Err(e) => {
                self.park(item.clone(), e.to_string(), false);
                return Err(e);
            }
        }

        info!(
            "Executing item {} of operation {} (attempt {}/{})",
            item.id, operation_id, attempt, item.max_retries
        );

        let timer = Instant::now();
        let result = match self.handlers.resolve(&item.handler) {
            Some(handler) => {
                let ctx = HandlerContext::new(
                    operation_id,
                    item.id,
                    attempt,
                    self.cancellation_flag(&operation_id),
                    self.registry.clone(),
                );
                AssertUnwindSafe(handler.handle(ctx, item.payload.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(HandlerError::new("Handler panicked").with_code("handler_panic"))
                    })
            }
            None => Err(HandlerError::new(format!(
                "No handler registered for {}",
                item.handler
            ))
            .with_code("handler_not_found")),
        };
        let duration = timer.elapsed();

        let outcome = match result {
            Ok(output) => {
                debug!(
                    "Item {} of operation {} succeeded in {:?}",
                    item.id, operation_id, duration
                );
                self.record_success(&item, &output)?;
                AttemptOutcome::Succeeded
            }
            Err(err) => {
                warn!(
                    "Item {} of operation {} failed after {:?}: {}",
                    item.id, operation_id, duration, err
                );
                self.record_failure(item.clone(), err)?
            }
        };

        Ok(report(outcome))
    }

    /// Apply a successful attempt to the operation's counters
    ///
    /// With a declared total the handler's record counts are applied. When
    /// the total is derived from enqueued items, the item is the unit and
    /// counts as one success whatever records it reports.
    fn record_success(&self, item: &QueueItem, output: &HandlerOutput) -> Result<()> {
        self.registry.update(&item.operation_id, |op| {
            if op.total_from_items {
                if output.processed != 1 || output.failed > 0 {
                    debug!(
                        "Item {} reported {} record(s), {} failed; counted as one item",
                        item.id, output.processed, output.failed
                    );
                }
                if op.remaining_items() > 0 {
                    op.processed_items += 1;
                    op.success_items += 1;
                }
            } else {
                let processed = output.processed.min(op.remaining_items());
                let failed = output.failed.min(processed);
                op.processed_items += processed;
                op.success_items += processed - failed;
                op.failed_items += failed;
            }
            op.progress = op.computed_progress();
            Ok(())
        })?;
        Ok(())
    }

    fn record_failure(&self, mut item: QueueItem, err: HandlerError) -> Result<AttemptOutcome> {
        item.retry_count += 1;
        let operation_id = item.operation_id;

        if self.is_cancelled(&operation_id) {
            info!(
                "Operation {} was stopped; not retrying item {}",
                operation_id, item.id
            );
            self.park(item, err.message, false);
            return Ok(AttemptOutcome::Abandoned);
        }

        if item.retry_count < item.max_retries {
            let delay = self.backoff.delay_for(item.retry_count);
            let offset = chrono::Duration::from_std(delay)
                .map_err(|e| OpsError::internal(format!("Backoff delay out of range: {}", e)))?;
            item.scheduled_at = Utc::now() + offset;
            info!(
                "Retrying item {} of operation {} in {:?} ({}/{} attempts used)",
                item.id, operation_id, delay, item.retry_count, item.max_retries
            );
            self.queue.enqueue(item);
            self.wake();
            return Ok(AttemptOutcome::RetryScheduled { delay });
        }

        error!(
            "Item {} of operation {} exhausted {} attempt(s): {}",
            item.id, operation_id, item.max_retries, err
        );

        let mut counted = false;
        self.registry.update(&operation_id, |op| {
            if op.remaining_items() > 0 {
                op.processed_items += 1;
                op.failed_items += 1;
                counted = true;
            }
            op.error = Some(err.message.clone());
            op.progress = op.computed_progress();
            Ok(())
        })?;

        if item.stop_on_error {
            if let Some(batch_id) = item.batch_id {
                let aborted = self.queue.remove_where(|i| i.batch_id == Some(batch_id));
                if !aborted.is_empty() {
                    warn!(
                        "Aborted {} remaining item(s) of batch {} after item {} failed",
                        aborted.len(),
                        batch_id,
                        item.id
                    );
                }
                for skipped in aborted {
                    self.park(
                        skipped,
                        format!("Batch aborted after item {} failed", item.id),
                        false,
                    );
                }
            }
        }

        self.park(item, err.message, counted);
        Ok(AttemptOutcome::Exhausted)
    }

    fn park(&self, item: QueueItem, error: String, counted: bool) {
        self.failed.lock().insert(
            item.id,
            FailedItem {
                item,
                error,
                failed_at: Utc::now(),
                counted,
            },
        );
    }

    /// Finalize the operation if it has no outstanding work
    fn settle(&self, operation_id: &OperationId) -> Result<Option<OperationStatus>> {
        let _lifecycle = self.lifecycle.lock();
        self.settle_locked(operation_id)
    }

    fn settle_locked(&self, operation_id: &OperationId) -> Result<Option<OperationStatus>> {
        if self.queue.count_for(operation_id) > 0 {
            return Ok(None);
        }
        if self
            .in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.operation_id == *operation_id)
        {
            return Ok(None);
        }

        let cancelled = self.is_cancelled(operation_id);
        let has_failures = self
            .failed
            .lock()
            .values()
            .any(|f| f.item.operation_id == *operation_id);

        let mut finished = false;
        let operation = self.registry.update(operation_id, |op| {
            if op.status.is_terminal() {
                return Ok(());
            }
            // A declared total keeps the operation open for later items
            if !cancelled
                && !has_failures
                && !op.total_from_items
                && op.processed_items < op.total_items
            {
                return Ok(());
            }
            if cancelled {
                op.status = OperationStatus::Failed;
                if op.error.is_none() {
                    op.error = Some("Operation stopped by user".to_string());
                }
            } else if has_failures {
                op.status = OperationStatus::Failed;
            } else {
                op.status = OperationStatus::Completed;
                op.progress = 100.0;
            }
            op.completed_at = Some(Utc::now());
            finished = true;
            Ok(())
        })?;

        if !finished {
            if !operation.is_terminal() {
                debug!(
                    "Operation {} idle at {}/{} item(s); awaiting more work",
                    operation_id, operation.processed_items, operation.total_items
                );
            }
            return Ok(None);
        }

        self.archive(&operation);
        Ok(Some(operation.status))
    }

    fn archive(&self, operation: &Operation) {
        match operation.status {
            OperationStatus::Completed => info!(
                "Operation {} completed: {}/{} succeeded",
                operation.id, operation.success_items, operation.total_items
            ),
            _ => error!(
                "Operation {} failed: {}",
                operation.id,
                operation.error.as_deref().unwrap_or("unknown error")
            ),
        }
        self.history
            .append(HistoryRecord::from_operation(operation.clone()));
    }

    /// Queue items for an operation that still accepts work
    ///
    /// Holds the lifecycle lock so the operation cannot settle between the
    /// terminal check and the push.
    pub fn admit(
        &self,
        operation_id: &OperationId,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueItemId>> {
        let ids = {
            let _lifecycle = self.lifecycle.lock();
            let added = items.len() as u64;
            self.registry.update(operation_id, |op| {
                if op.is_terminal() {
                    return Err(OpsError::validation(format!(
                        "Operation {} is {} and cannot accept new items",
                        op.id, op.status
                    )));
                }
                if op.total_from_items {
                    op.total_items += added;
                    op.progress = op.computed_progress();
                }
                Ok(())
            })?;
            items
                .into_iter()
                .map(|item| self.queue.enqueue(item))
                .collect()
        };
        self.wake();
        Ok(ids)
    }

    /// Block future pickup of the operation's items
    pub fn pause(&self, operation_id: &OperationId) -> Result<Operation> {
        let operation = self
            .registry
            .transition(operation_id, OperationStatus::Paused)?;
        info!("Paused operation {}", operation_id);
        Ok(operation)
    }

    /// Allow pickup again; returns to `running` if work had started
    pub fn resume(&self, operation_id: &OperationId) -> Result<Operation> {
        let operation = self.registry.update(operation_id, |op| {
            if op.status != OperationStatus::Paused {
                return Err(OpsError::validation(format!(
                    "Operation {} is {}, not paused",
                    op.id, op.status
                )));
            }
            op.status = if op.started_at.is_some() {
                OperationStatus::Running
            } else {
                OperationStatus::Pending
            };
            Ok(())
        })?;
        info!("Resumed operation {}", operation_id);
        self.wake();
        Ok(operation)
    }

    /// Cooperatively stop an operation
    ///
    /// Queued items are parked, the cancellation flag is raised for a handler
    /// already in flight, and the operation fails once nothing is running.
    pub fn stop(&self, operation_id: &OperationId) -> Result<Operation> {
        let operation = self.registry.require(operation_id)?;
        if operation.is_terminal() {
            return Err(OpsError::validation(format!(
                "Operation {} is already {}",
                operation_id, operation.status
            )));
        }

        self.cancellation_flag(operation_id)
            .store(true, Ordering::Release);

        let _lifecycle = self.lifecycle.lock();
        let removed = self
            .queue
            .remove_where(|item| item.operation_id == *operation_id);
        info!(
            "Stop requested for operation {}; {} queued item(s) withdrawn",
            operation_id,
            removed.len()
        );
        for item in removed {
            self.park(item, "Operation stopped before this item ran".to_string(), false);
        }

        self.settle_locked(operation_id)?;
        self.registry.require(operation_id)
    }

    /// Re-enqueue a parked item with a fresh retry budget
    ///
    /// A failed operation moves back to `pending` and starts a new cycle.
    pub fn retry(&self, item_id: &QueueItemId) -> Result<QueueItemId> {
        let _lifecycle = self.lifecycle.lock();

        let parked = self
            .failed
            .lock()
            .remove(item_id)
            .ok_or_else(|| OpsError::not_found(format!("No failed item {}", item_id)))?;
        let operation_id = parked.item.operation_id;

        let mut new_cycle = false;
        let updated = self.registry.update(&operation_id, |op| {
            if op.status == OperationStatus::Completed {
                return Err(OpsError::validation(format!(
                    "Operation {} already completed",
                    op.id
                )));
            }
            if op.status == OperationStatus::Failed {
                op.status = OperationStatus::Pending;
                op.cycle += 1;
                op.error = None;
                op.started_at = None;
                op.completed_at = None;
                new_cycle = true;
            }
            if parked.counted {
                op.processed_items = op.processed_items.saturating_sub(1);
                op.failed_items = op.failed_items.saturating_sub(1);
            }
            op.progress = op.computed_progress();
            Ok(())
        });

        if let Err(e) = updated {
            self.failed.lock().insert(*item_id, parked);
            return Err(e);
        }

        if new_cycle {
            if let Some(flag) = self.cancellations.get(&operation_id) {
                flag.store(false, Ordering::Release);
            }
        }

        let mut item = parked.item;
        item.retry_count = 0;
        item.scheduled_at = Utc::now();
        info!(
            "Manual retry of item {} for operation {}{}",
            item.id,
            operation_id,
            if new_cycle { " (new cycle)" } else { "" }
        );
        let id = self.queue.enqueue(item);
        self.wake();
        Ok(id)
    }

    /// Retry every parked item of an operation, in original enqueue order
    pub fn retry_operation(&self, operation_id: &OperationId) -> Result<Vec<QueueItemId>> {
        let parked = self.failed_items_for(operation_id);
        if parked.is_empty() {
            return Err(OpsError::validation(format!(
                "Operation {} has no failed items to retry",
                operation_id
            )));
        }
        parked
            .iter()
            .map(|failed| self.retry(&failed.item.id))
            .collect()
    }

    /// Drop every trace of an operation from the executor
    pub(crate) fn forget(&self, operation_id: &OperationId) {
        let _lifecycle = self.lifecycle.lock();
        self.queue
            .remove_where(|item| item.operation_id == *operation_id);
        self.failed
            .lock()
            .retain(|_, f| f.item.operation_id != *operation_id);
        self.cancellations.remove(operation_id);
    }
}
