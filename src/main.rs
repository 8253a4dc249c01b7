//! batch-ops - run a plan of bulk operations through the engine
//!
//! Every operation type is served by a simulated handler driven by the item
//! payload, which makes the binary handy for exercising retry, priority and
//! history behaviour without touching a real system.

use anyhow::Context;
use async_trait::async_trait;
use batch_ops::{
    EngineConfig, HandlerContext, HandlerError, HandlerOutput, OperationEngine, OperationHandler,
    OperationSpec, OperationStatus, OperationType, QueueItemSpec, RollbackType,
    utils::{LogFormat, init_logging},
};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "batch-ops", version, about = "Run a YAML plan of batch operations")]
struct Cli {
    /// Plan file describing operations and their items
    #[arg(short, long)]
    plan: PathBuf,

    /// Engine configuration file; BATCH_OPS_* variables override it
    #[arg(short, long, env = "BATCH_OPS_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Exit non-zero if any operation fails or is left unfinished
    #[arg(long)]
    strict: bool,
}

/// Top-level plan document
#[derive(Debug, Deserialize)]
struct Plan {
    operations: Vec<PlannedOperation>,
}

#[derive(Debug, Deserialize)]
struct PlannedOperation {
    #[serde(flatten)]
    spec: OperationSpec,
    #[serde(default)]
    items: Vec<QueueItemSpec>,
    #[serde(default)]
    stop_on_error: bool,
    /// Pre-image recorded as a database checkpoint before any item runs
    #[serde(default)]
    checkpoint: Option<serde_json::Value>,
}

/// Payload-driven stand-in for real work
///
/// Recognised payload keys: `delay_ms`, `fail_times` (fail the first N
/// attempts), `records` and `failed_records`.
struct SimulatedHandler;

#[async_trait]
impl OperationHandler for SimulatedHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        let delay_ms = payload["delay_ms"].as_u64().unwrap_or(0);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if ctx.is_cancelled() {
            return Err(HandlerError::new("Cancelled").with_code("cancelled"));
        }

        let fail_times = payload["fail_times"].as_u64().unwrap_or(0);
        if u64::from(ctx.attempt()) <= fail_times {
            return Err(HandlerError::new(format!(
                "Simulated failure on attempt {}",
                ctx.attempt()
            ))
            .with_code("simulated"));
        }

        let records = payload["records"].as_u64().unwrap_or(1);
        let failed = payload["failed_records"].as_u64().unwrap_or(0);
        Ok(HandlerOutput::items(records, failed))
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
        if payload.is_null() {
            return Ok(());
        }
        if !payload.is_object() {
            return Err("payload must be a mapping".to_string());
        }
        for key in ["delay_ms", "fail_times", "records", "failed_records"] {
            if !payload[key].is_null() && payload[key].as_u64().is_none() {
                return Err(format!("payload.{} must be a non-negative integer", key));
            }
        }
        Ok(())
    }
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)
                .await
                .with_context(|| format!("loading config {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(EngineConfig::from_env()?),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.as_ref()).await?;

    let raw = tokio::fs::read_to_string(&cli.plan)
        .await
        .with_context(|| format!("reading plan {}", cli.plan.display()))?;
    let plan: Plan = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing plan {}", cli.plan.display()))?;

    let engine = OperationEngine::new(config)?;
    let handler: Arc<dyn OperationHandler> = Arc::new(SimulatedHandler);
    for operation_type in OperationType::ALL {
        engine.register_handler(operation_type, handler.clone());
    }

    for planned in plan.operations {
        let title = planned.spec.title.clone();
        let destructive = planned.spec.operation_type.is_destructive();
        let id = engine
            .register_operation(planned.spec)
            .with_context(|| format!("registering '{}'", title))?;

        match planned.checkpoint {
            Some(snapshot) => {
                engine.record_rollback(&id, RollbackType::Database, snapshot, HashMap::new())?;
            }
            None if destructive => {
                warn!("Destructive operation '{}' has no checkpoint", title);
            }
            None => {}
        }

        if planned.items.is_empty() {
            warn!("Operation '{}' has no items", title);
            continue;
        }
        engine
            .enqueue_batch(&id, planned.items, planned.stop_on_error)
            .with_context(|| format!("enqueuing items of '{}'", title))?;
    }

    let reports = engine.drain().await?;
    info!("Executed {} attempt(s)", reports.len());

    let history = engine.list_history();
    let output = serde_json::json!({
        "build": batch_ops::build_info(),
        "stats": engine.history_stats(),
        "rollbacks": engine.list_rollbacks().len(),
        "history": history,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    let operations = engine.list_operations();
    for open in operations.iter().filter(|op| !op.is_terminal()) {
        warn!(
            "Operation '{}' is still {} at {}/{} item(s)",
            open.title, open.status, open.processed_items, open.total_items
        );
    }
    let any_failed = operations
        .iter()
        .any(|op| op.status == OperationStatus::Failed || !op.is_terminal());
    Ok(if cli.strict && any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.log_format) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
