//! Operator commands and their JSON envelope.
//!
//! Every command returns an [`OpResponse`], whether it succeeded or not, so
//! callers can always parse the output.

use serde::Serialize;
use serde_json::Value;

use crate::orchestrator::{Orchestrator, SyncError, TaskKind};

/// Uniform result envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpResponse<T = Value> {
    /// Whether the command succeeded.
    pub success: bool,
    /// Short human-readable summary.
    pub message: String,
    /// Command payload, absent on failure.
    pub data: Option<T>,
}

impl<T> OpResponse<T> {
    /// Successful response.
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failed response.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Run one task now.
    Trigger(TaskKind),
    /// List active batches.
    Status,
    /// List failed batches awaiting cancellation.
    Failed,
    /// List archived batches, newest first.
    History {
        /// Maximum rows.
        limit: u32,
    },
    /// Re-run the pending transition of one batch.
    Retry(String),
    /// Cancel one unfinished batch.
    Cancel(String),
    /// Archive every active batch as failed.
    ClearActive,
    /// Print the memory map.
    ShowMap,
}

/// Runs `op` and wraps the outcome.
pub async fn execute(orchestrator: &Orchestrator, op: Operation) -> OpResponse {
    match run(orchestrator, &op).await {
        Ok((message, data)) => OpResponse::ok(message, data),
        Err(e) => {
            tracing::warn!(?op, error = %e, "operation failed");
            OpResponse::failed(e.to_string())
        }
    }
}

async fn run(orchestrator: &Orchestrator, op: &Operation) -> Result<(String, Value), SyncError> {
    let result = match op {
        Operation::Trigger(kind) => {
            let report = orchestrator.trigger(*kind).await?;
            (format!("{kind} finished"), to_value(&report)?)
        }
        Operation::Status => {
            let batches = orchestrator.current_batches().await?;
            (format!("{} active batches", batches.len()), to_value(&batches)?)
        }
        Operation::Failed => {
            let batches = orchestrator.failed_batches().await?;
            (format!("{} failed batches", batches.len()), to_value(&batches)?)
        }
        Operation::History { limit } => {
            let history = orchestrator.history(*limit).await?;
            (format!("{} archived batches", history.len()), to_value(&history)?)
        }
        Operation::Retry(work_order) => {
            let record = orchestrator.retry_batch(work_order).await?;
            (
                format!("{work_order} archived as {}", record.outcome),
                to_value(&record)?,
            )
        }
        Operation::Cancel(work_order) => {
            let record = orchestrator.cancel_batch(work_order).await?;
            (format!("{work_order} cancelled"), to_value(&record)?)
        }
        Operation::ClearActive => {
            let cleared = orchestrator.clear_active().await?;
            (
                format!("{cleared} active batches archived as failed"),
                serde_json::json!({ "cleared": cleared }),
            )
        }
        Operation::ShowMap => (
            "memory map".to_string(),
            to_value(orchestrator.memory_map())?,
        ),
    };
    Ok(result)
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Store(e.into()))
}
