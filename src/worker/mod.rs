//! Executor boundary.
//!
//! The engine never runs task content itself. It hands each attempt to a
//! [`TaskExecutor`] together with the reserved worker, the attempt number,
//! the task's absolute deadline and a cancellation token. Executors should
//! stop early when the token fires, but the engine tolerates ones that don't.

mod command;

pub use command::{CommandExecutor, DEFAULT_SHELL};

use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    pub worker_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub deadline: Option<DateTime<Utc>>,
}

/// Whether the executor considers the attempt a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    /// Result payload, opaque to the engine
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Attach an output payload.
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Abstraction over task execution.
/// Real implementation: `CommandExecutor`. Dry runs: `DryRunExecutor`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken)
    -> ExecutionOutcome;
}

/// Reports success for every task without running anything.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    delay: Duration,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend each attempt takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TaskExecutor for DryRunExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return ExecutionOutcome::failure("cancelled"),
            }
        }
        ExecutionOutcome::success(serde_json::json!({
            "dry_run": true,
            "task": request.task.id,
            "worker": request.worker_id,
        }))
    }
}
