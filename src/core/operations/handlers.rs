//! Handler dispatch
//!
//! Queue items carry a serializable [`HandlerRef`]; the executor resolves it
//! against a [`HandlerRegistry`] at execution time instead of storing a live
//! function reference on the item.

use super::registry::OperationRegistry;
use super::types::{HandlerRef, OperationId, QueueItemId};
use crate::utils::error::OpsError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Error raised by a handler; drives retry/backoff
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    /// Error message, retained on the operation once retries are exhausted
    pub message: String,
    /// Error code (if available)
    pub code: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<OpsError> for HandlerError {
    fn from(err: OpsError) -> Self {
        Self {
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What a successful handler invocation reports back to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Records covered by this item
    pub processed: u64,
    /// Records among `processed` that the handler could not apply
    pub failed: u64,
    /// Free-form result details
    pub detail: Option<serde_json::Value>,
}

impl Default for HandlerOutput {
    fn default() -> Self {
        Self::items(1, 0)
    }
}

impl HandlerOutput {
    pub fn items(processed: u64, failed: u64) -> Self {
        Self {
            processed,
            failed: failed.min(processed),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Per-invocation context handed to handlers
#[derive(Clone)]
pub struct HandlerContext {
    operation_id: OperationId,
    item_id: QueueItemId,
    attempt: u32,
    cancelled: Arc<AtomicBool>,
    registry: OperationRegistry,
}

impl HandlerContext {
    pub(crate) fn new(
        operation_id: OperationId,
        item_id: QueueItemId,
        attempt: u32,
        cancelled: Arc<AtomicBool>,
        registry: OperationRegistry,
    ) -> Self {
        Self {
            operation_id,
            item_id,
            attempt,
            cancelled,
            registry,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn item_id(&self) -> QueueItemId {
        self.item_id
    }

    /// 1-based attempt number of this invocation
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Set by `stop()`; long-running handlers should poll it and bail out
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Report progress of a named phase of the owning operation
    pub fn advance_phase(&self, phase: &str, progress: f64) -> Result<(), HandlerError> {
        self.registry
            .advance_phase(&self.operation_id, phase, progress)
            .map(|_| ())
            .map_err(HandlerError::from)
    }
}

/// Caller-supplied unit of work for a queue item
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute one item
    async fn handle(
        &self,
        ctx: HandlerContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError>;

    /// Pre-flight check run at enqueue time; an error rejects the item
    fn validate(&self, _payload: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Adapter turning an async closure into an [`OperationHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(HandlerContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.f)(ctx, payload).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```rust,ignore
/// engine.register_handler(
///     OperationType::BulkDelete,
///     handler_fn(|_ctx, payload| async move {
///         let ids = payload["ids"].as_array().map(Vec::len).unwrap_or(0) as u64;
///         Ok(HandlerOutput::items(ids, 0))
///     }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(HandlerContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Dispatch table from handler references to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerRef, Arc<dyn OperationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `handler_ref`
    pub fn register(&self, handler_ref: HandlerRef, handler: Arc<dyn OperationHandler>) {
        self.handlers.write().insert(handler_ref, handler);
    }

    pub fn resolve(&self, handler_ref: &HandlerRef) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(handler_ref).cloned()
    }

    pub fn unregister(&self, handler_ref: &HandlerRef) -> bool {
        self.handlers.write().remove(handler_ref).is_some()
    }

    pub fn registered(&self) -> Vec<HandlerRef> {
        self.handlers.read().keys().cloned().collect()
    }
}
