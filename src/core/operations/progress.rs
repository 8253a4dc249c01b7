//! Throughput and ETA tracking for running operations

use super::registry::OperationRegistry;
use super::types::{Operation, OperationId, OperationStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Point-in-time progress of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub percent: f64,
    pub processed_items: u64,
    pub total_items: u64,
    pub elapsed: Duration,
    /// Processed items per second since the operation started
    pub items_per_second: f64,
    /// `None` while nothing has been processed yet or when the estimate
    /// does not fit in a `Duration`
    pub remaining: Option<Duration>,
    pub eta: Option<DateTime<Utc>>,
    pub current_phase: Option<String>,
    pub computed_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Derive throughput and ETA from an operation's counters
    pub fn compute(operation: &Operation, now: DateTime<Utc>) -> Self {
        let elapsed = operation
            .started_at
            .and_then(|started| (now - started).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let elapsed_secs = elapsed.as_secs_f64();
        let items_per_second = if elapsed_secs > 0.0 {
            operation.processed_items as f64 / elapsed_secs
        } else {
            0.0
        };

        let remaining = (items_per_second > 0.0)
            .then(|| operation.remaining_items() as f64 / items_per_second)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        let eta = remaining
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .and_then(|d| now.checked_add_signed(d));

        let percent = if operation.status == OperationStatus::Completed {
            100.0
        } else {
            operation.computed_progress()
        };

        Self {
            operation_id: operation.id,
            status: operation.status,
            percent,
            processed_items: operation.processed_items,
            total_items: operation.total_items,
            elapsed,
            items_per_second,
            remaining,
            eta,
            current_phase: operation.current_phase().map(|p| p.name.clone()),
            computed_at: now,
        }
    }
}

/// Periodically recomputes snapshots for running operations
pub struct ProgressTracker {
    registry: OperationRegistry,
    latest: RwLock<HashMap<OperationId, ProgressSnapshot>>,
    events: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(registry: OperationRegistry) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            latest: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to snapshots published by [`refresh`](Self::refresh)
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.events.subscribe()
    }

    /// Recompute snapshots for every running operation
    pub fn refresh(&self) -> Vec<ProgressSnapshot> {
        let now = Utc::now();
        let snapshots: Vec<ProgressSnapshot> = self
            .registry
            .list_by_status(OperationStatus::Running)
            .iter()
            .map(|op| ProgressSnapshot::compute(op, now))
            .collect();

        {
            let mut latest = self.latest.write();
            latest.clear();
            for snapshot in &snapshots {
                latest.insert(snapshot.operation_id, snapshot.clone());
            }
        }

        for snapshot in &snapshots {
            // No subscribers is fine
            let _ = self.events.send(snapshot.clone());
        }
        debug!("Refreshed progress for {} running operation(s)", snapshots.len());
        snapshots
    }

    /// Snapshot from the last refresh, if the operation was running then
    pub fn cached(&self, id: &OperationId) -> Option<ProgressSnapshot> {
        self.latest.read().get(id).cloned()
    }

    /// Fresh snapshot computed from the registry
    pub fn snapshot(&self, id: &OperationId) -> Option<ProgressSnapshot> {
        self.registry
            .get(id)
            .map(|op| ProgressSnapshot::compute(&op, Utc::now()))
    }

    /// Spawn the refresh loop; it exits when `shutdown` flips to `true`
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Progress tracker started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        self.refresh();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Progress tracker stopped");
        })
    }
}
