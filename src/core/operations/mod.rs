//! Batch operation engine
//!
//! Operations are registered in the [`OperationRegistry`], split into queue
//! items ordered by the [`PriorityQueue`], and executed one at a time by the
//! [`Executor`] with exponential backoff between failed attempts. Terminal
//! outcomes land in the bounded [`HistoryLog`]; pre-images recorded in the
//! [`RollbackStore`] can be restored explicitly. [`OperationEngine`] wires
//! the pieces together.

mod backoff;
mod engine;
mod executor;
mod handlers;
mod history;
mod progress;
mod queue;
mod registry;
mod rollback;
mod types;

pub use backoff::BackoffPolicy;
pub use engine::OperationEngine;
pub use executor::{AttemptOutcome, ExecutionReport, Executor, FailedItem, InFlight};
pub use handlers::{
    FnHandler, HandlerContext, HandlerError, HandlerOutput, HandlerRegistry, OperationHandler,
    handler_fn,
};
pub use history::{HistoryFilter, HistoryLog, HistoryRecord, HistoryStats, OperationResult};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use queue::PriorityQueue;
pub use registry::{InMemoryOperationStore, OperationRegistry, OperationStore};
pub use rollback::{
    RestoreOutcome, RestoreStrategy, RetentionPolicy, RollbackData, RollbackStore, RollbackType,
    compute_checksum,
};
pub use types::{
    BatchId, HandlerRef, HistoryRecordId, Operation, OperationId, OperationSpec, OperationStatus,
    OperationType, Priority, ProgressPhase, QueueItem, QueueItemId, QueueItemSpec, RollbackId,
};
