//! Operation, queue item and identifier types

use crate::utils::error::OpsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = OpsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    OpsError::validation(format!("Invalid {}: {}", stringify!($name), e))
                })
            }
        }
    };
}

opaque_id!(
    /// Identifier of a registered operation
    OperationId
);
opaque_id!(
    /// Identifier of a queue item (stable across retries)
    QueueItemId
);
opaque_id!(
    /// Identifier shared by the items of one `enqueue_batch` call
    BatchId
);
opaque_id!(
    /// Identifier of a rollback checkpoint
    RollbackId
);
opaque_id!(
    /// Identifier of a history record
    HistoryRecordId
);

/// Kinds of bulk work the engine schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Bulk edit of existing records
    BulkUpdate,
    /// Bulk removal of records
    BulkDelete,
    /// Import from an external source
    Import,
    /// Export to an external sink
    Export,
    /// Campaign processing (sends, scheduling, recalculation)
    CampaignProcess,
    /// Mass user-management actions
    UserManagement,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::BulkUpdate,
        OperationType::BulkDelete,
        OperationType::Import,
        OperationType::Export,
        OperationType::CampaignProcess,
        OperationType::UserManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::BulkUpdate => "bulk_update",
            OperationType::BulkDelete => "bulk_delete",
            OperationType::Import => "import",
            OperationType::Export => "export",
            OperationType::CampaignProcess => "campaign_process",
            OperationType::UserManagement => "user_management",
        }
    }

    /// Operation types that overwrite or remove existing state
    pub fn is_destructive(&self) -> bool {
        !matches!(self, OperationType::Export | OperationType::CampaignProcess)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        OperationType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| OpsError::validation(format!("Unknown operation type: {}", s)))
    }
}

/// Queue priority tier, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Tiers in dequeue order
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Position in dequeue order (0 is served first)
    pub fn tier(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| OpsError::configuration(format!("Unknown priority: {}", s)))
    }
}

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Whether the executor may pick up items of an operation in this state
    pub fn accepts_work(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }

    /// Allowed edges of the operation state machine
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, Running | Paused | Failed)
                | (Running, Paused | Completed | Failed)
                | (Paused, Running | Pending | Completed | Failed)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Paused => "paused",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named stage of an operation with internal sub-steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPhase {
    pub name: String,
    /// Percentage in `0.0..=100.0`
    pub progress: f64,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressPhase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            progress: 0.0,
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// A tracked unit of bulk work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub operation_type: OperationType,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: OperationStatus,
    pub total_items: u64,
    pub processed_items: u64,
    pub success_items: u64,
    pub failed_items: u64,
    /// Coarse progress percentage in `0.0..=100.0`
    pub progress: f64,
    /// Handler invocations across all items and cycles
    pub attempts: u32,
    /// Incremented by each manual retry of a failed operation
    pub cycle: u32,
    pub phases: Vec<ProgressPhase>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub payload: serde_json::Value,
    pub tags: HashMap<String, String>,
    /// `total_items` grows with every enqueued item instead of being fixed
    pub total_from_items: bool,
}

impl Operation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Percentage derived from the item counters
    pub fn computed_progress(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.processed_items as f64 / self.total_items as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// First phase that has not reached 100%
    pub fn current_phase(&self) -> Option<&ProgressPhase> {
        self.phases.iter().find(|p| !p.is_complete())
    }

    pub fn remaining_items(&self) -> u64 {
        self.total_items.saturating_sub(self.processed_items)
    }
}

/// Registration request for a new operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub operation_type: OperationType,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Fixed item count; derived from enqueued items when absent
    #[serde(default)]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub phases: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl OperationSpec {
    pub fn new(operation_type: OperationType, title: impl Into<String>) -> Self {
        Self {
            operation_type,
            title: title.into(),
            description: None,
            priority: Priority::default(),
            total_items: None,
            payload: serde_json::Value::Null,
            created_by: None,
            phases: Vec::new(),
            tags: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_total_items(mut self, total_items: u64) -> Self {
        self.total_items = Some(total_items);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    pub fn with_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases = phases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Serializable reference to a registered handler
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum HandlerRef {
    /// The handler registered for an operation type
    Operation(OperationType),
    /// A handler registered under a custom name
    Named(String),
}

impl HandlerRef {
    pub fn named(name: impl Into<String>) -> Self {
        HandlerRef::Named(name.into())
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Operation(t) => write!(f, "operation:{}", t),
            HandlerRef::Named(name) => write!(f, "named:{}", name),
        }
    }
}

impl From<OperationType> for HandlerRef {
    fn from(value: OperationType) -> Self {
        HandlerRef::Operation(value)
    }
}

/// One schedulable execution attempt belonging to an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub operation_id: OperationId,
    pub batch_id: Option<BatchId>,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not eligible for dequeue before this instant
    pub scheduled_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub handler: HandlerRef,
    /// Abort the rest of the batch when this item exhausts its retries
    pub stop_on_error: bool,
    /// Insertion order, assigned by the queue
    pub sequence: u64,
}

impl QueueItem {
    /// 1-based number of the attempt the next execution will be
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

/// Enqueue request for a single item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueItemSpec {
    /// Overrides the operation priority
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to the handler of the operation's type
    #[serde(default)]
    pub handler: Option<HandlerRef>,
    /// Defaults to the configured `queue.default_max_retries`
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl QueueItemSpec {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_handler(mut self, handler: impl Into<HandlerRef>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}
