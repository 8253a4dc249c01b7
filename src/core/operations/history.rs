//! Bounded, append-only audit trail of terminal operation outcomes

use super::types::{HistoryRecordId, Operation, OperationStatus, OperationType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Outcome class of a finished operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Success,
    Failure,
    Partial,
}

impl OperationResult {
    /// Classify a terminal operation by its status and item counters
    ///
    /// A failed operation is always a failure, however many items succeeded.
    /// `Partial` marks a completed operation whose handlers reported failed
    /// records.
    pub fn classify(operation: &Operation) -> Self {
        match operation.status {
            OperationStatus::Completed if operation.failed_items == 0 => OperationResult::Success,
            OperationStatus::Completed => OperationResult::Partial,
            _ => OperationResult::Failure,
        }
    }
}

/// Immutable snapshot of an operation at a terminal transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: HistoryRecordId,
    pub operation: Operation,
    pub result: OperationResult,
    /// Who the work was performed for
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_operation(operation: Operation) -> Self {
        Self {
            id: HistoryRecordId::new(),
            result: OperationResult::classify(&operation),
            actor: operation.created_by.clone(),
            recorded_at: Utc::now(),
            operation,
        }
    }
}

/// Criteria for [`HistoryLog::filter`]; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub result: Option<OperationResult>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of title or description
    pub search: Option<String>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_result(mut self, result: OperationResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        let op = &record.operation;

        if self.operation_type.is_some_and(|t| t != op.operation_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != op.status) {
            return false;
        }
        if self.result.is_some_and(|r| r != record.result) {
            return false;
        }
        if self.from.is_some_and(|from| record.recorded_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.recorded_at > to) {
            return false;
        }

        match self.search.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let needle = text.to_lowercase();
                op.title.to_lowercase().contains(&needle)
                    || op
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            }
            _ => true,
        }
    }
}

/// Aggregate counts over the retained records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub partial: usize,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct HistoryStorage {
    records: VecDeque<HistoryRecord>,
    evicted: u64,
}

/// Capacity-bounded history log; the oldest record is evicted on overflow
#[derive(Debug)]
pub struct HistoryLog {
    storage: RwLock<HistoryStorage>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: RwLock::new(HistoryStorage::default()),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, returning the record evicted to make room
    pub fn append(&self, record: HistoryRecord) -> Option<HistoryRecord> {
        debug!(
            "History: operation {} finished with {:?}",
            record.operation.id, record.result
        );

        let mut storage = self.storage.write();
        storage.records.push_back(record);
        if storage.records.len() > self.capacity {
            storage.evicted += 1;
            return storage.records.pop_front();
        }
        None
    }

    /// All retained records, oldest first
    pub fn list(&self) -> Vec<HistoryRecord> {
        self.storage.read().records.iter().cloned().collect()
    }

    /// The `n` most recent records, newest first
    pub fn latest(&self, n: usize) -> Vec<HistoryRecord> {
        self.storage
            .read()
            .records
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// Matching records, oldest first
    pub fn filter(&self, filter: &HistoryFilter) -> Vec<HistoryRecord> {
        self.storage
            .read()
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let storage = self.storage.read();
        let mut stats = HistoryStats {
            total: storage.records.len(),
            evicted: storage.evicted,
            ..HistoryStats::default()
        };
        for record in &storage.records {
            match record.result {
                OperationResult::Success => stats.succeeded += 1,
                OperationResult::Failure => stats.failed += 1,
                OperationResult::Partial => stats.partial += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.storage.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
