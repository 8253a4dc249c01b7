//! # batch-ops
//!
//! An in-process batch operation queue and execution engine.
//!
//! ## Features
//!
//! - **Priority scheduling**: four tiers, FIFO within a tier
//! - **Serial execution**: at most one item in flight at any time
//! - **Retry with backoff**: failed items are rescheduled with exponential delays
//! - **Progress tracking**: throughput and ETA for running operations
//! - **Rollback checkpoints**: checksummed pre-images restored on request
//! - **Audit history**: bounded log of every terminal outcome
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batch_ops::{
//!     EngineConfig, HandlerOutput, OperationEngine, OperationSpec, OperationType, QueueItemSpec,
//!     handler_fn,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = OperationEngine::new(EngineConfig::default())?;
//!     engine.register_handler(
//!         OperationType::BulkUpdate,
//!         handler_fn(|_ctx, payload| async move {
//!             let ids = payload["ids"].as_array().map(Vec::len).unwrap_or(0) as u64;
//!             Ok(HandlerOutput::items(ids, 0))
//!         }),
//!     );
//!
//!     let op = engine.register_operation(
//!         OperationSpec::new(OperationType::BulkUpdate, "Tag VIP customers").with_total_items(3),
//!     )?;
//!     engine.enqueue(&op, QueueItemSpec::new(json!({"ids": [1, 2, 3]})))?;
//!     engine.drain().await?;
//!
//!     println!("{:?}", engine.get_operation(&op).map(|o| o.status));
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod core;
pub mod utils;

// Re-export main types
pub use config::{EngineConfig, Validate};
pub use crate::core::operations::*;
pub use utils::error::{OpsError, Result};

// Version information
/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Name of the crate
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Description of the crate
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    /// Unix timestamp of the build
    pub build_time: &'static str,
    pub git_hash: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: VERSION,
            build_time: option_env!("BATCH_OPS_BUILD_TIME").unwrap_or("unknown"),
            git_hash: option_env!("BATCH_OPS_GIT_HASH").unwrap_or("unknown"),
        }
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::default()
}
