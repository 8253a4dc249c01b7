//! Test fixtures and handler doubles
//!
//! All handlers are real [`OperationHandler`] implementations; they record
//! what they were asked to do so tests can assert on it.

use async_trait::async_trait;
use batch_ops::{
    EngineConfig, HandlerContext, HandlerError, HandlerOutput, HandlerRef, OperationEngine,
    OperationHandler, OperationId, OperationSpec, OperationType, Priority, RestoreStrategy,
    RollbackData,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Configuration with millisecond backoff and fast polling
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_delay_ms = 2;
    config.retry.max_delay_ms = 20;
    config.executor.idle_poll_ms = 10;
    config.progress.refresh_interval_ms = 10;
    config
}

pub fn fast_engine() -> OperationEngine {
    OperationEngine::new(fast_config()).expect("valid test config")
}

/// Register a normal-priority operation whose total follows its items
pub fn register(
    engine: &OperationEngine,
    operation_type: OperationType,
    title: &str,
) -> OperationId {
    engine
        .register_operation(OperationSpec::new(operation_type, title))
        .expect("operation registered")
}

pub fn register_with_priority(
    engine: &OperationEngine,
    operation_type: OperationType,
    title: &str,
    priority: Priority,
) -> OperationId {
    engine
        .register_operation(OperationSpec::new(operation_type, title).with_priority(priority))
        .expect("operation registered")
}

/// Records the `label` field of every payload it handles
#[derive(Default)]
pub struct Recorder {
    labels: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn install(engine: &OperationEngine, handler_ref: impl Into<HandlerRef>) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        engine.register_handler(handler_ref, recorder.clone());
        recorder
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().clone()
    }
}

#[async_trait]
impl OperationHandler for Recorder {
    async fn handle(
        &self,
        _ctx: HandlerContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        let label = payload["label"].as_str().unwrap_or("?").to_string();
        self.labels.lock().push(label);
        Ok(HandlerOutput::default())
    }
}

/// Fails the first `failures` attempts of every item, then succeeds
pub struct Flaky {
    failures: u32,
    invocations: AtomicU32,
    seen: Mutex<Vec<Instant>>,
}

impl Flaky {
    pub fn install(
        engine: &OperationEngine,
        handler_ref: impl Into<HandlerRef>,
        failures: u32,
    ) -> Arc<Self> {
        let flaky = Arc::new(Self {
            failures,
            invocations: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        });
        engine.register_handler(handler_ref, flaky.clone());
        flaky
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive invocations
    pub fn gaps(&self) -> Vec<Duration> {
        self.seen
            .lock()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

#[async_trait]
impl OperationHandler for Flaky {
    async fn handle(
        &self,
        ctx: HandlerContext,
        _payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(Instant::now());
        if ctx.attempt() <= self.failures {
            return Err(HandlerError::new(format!("transient failure #{}", ctx.attempt())));
        }
        Ok(HandlerOutput::default())
    }
}

/// Blocks its first invocation until [`release`](Gate::release) is called
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    released: Notify,
    calls: AtomicU32,
    saw_cancellation: AtomicBool,
}

impl Gate {
    pub fn install(engine: &OperationEngine, handler_ref: impl Into<HandlerRef>) -> Arc<Self> {
        let gate = Arc::new(Self::default());
        engine.register_handler(handler_ref, gate.clone());
        gate
    }

    /// Resolves once the first invocation is blocked inside the handler
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn saw_cancellation(&self) -> bool {
        self.saw_cancellation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationHandler for Gate {
    async fn handle(
        &self,
        ctx: HandlerContext,
        _payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            self.entered.notify_one();
            self.released.notified().await;
        }
        if ctx.is_cancelled() {
            self.saw_cancellation.store(true, Ordering::SeqCst);
        }
        Ok(HandlerOutput::default())
    }
}

/// Tracks how many invocations overlap
#[derive(Default)]
pub struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn install(engine: &OperationEngine, handler_ref: impl Into<HandlerRef>) -> Arc<Self> {
        let probe = Arc::new(Self::default());
        engine.register_handler(handler_ref, probe.clone());
        probe
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationHandler for ConcurrencyProbe {
    async fn handle(
        &self,
        _ctx: HandlerContext,
        _payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput::default())
    }
}

/// Restore strategy that remembers what it restored
#[derive(Default)]
pub struct RecordingStrategy {
    restored: Mutex<Vec<RollbackData>>,
}

impl RecordingStrategy {
    pub fn calls(&self) -> usize {
        self.restored.lock().len()
    }

    pub fn restored(&self) -> Vec<RollbackData> {
        self.restored.lock().clone()
    }
}

#[async_trait]
impl RestoreStrategy for RecordingStrategy {
    async fn restore(&self, checkpoint: &RollbackData) -> batch_ops::Result<Option<String>> {
        self.restored.lock().push(checkpoint.clone());
        Ok(Some(format!("restored {}", checkpoint.id)))
    }
}
