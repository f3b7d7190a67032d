//! Dispatch records: one immutable entry per execution attempt.

use crate::errors::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Succeeded,
    Failed { error: TaskError },
    /// Cancelled because its phase failed or the run was aborted
    Cancelled,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Failure detail, if any.
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// One attempt of one task on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub task_id: String,
    pub worker_id: String,
    /// Phase position the task belongs to
    pub phase: usize,
    /// 1-based attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: DispatchOutcome,
    /// Result payload returned by the executor
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
}

impl DispatchRecord {
    /// Wall-clock duration of the attempt.
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Append-only log of dispatch records shared between the run loop and readers.
#[derive(Debug, Default)]
pub struct DispatchLog {
    records: Mutex<Vec<DispatchRecord>>,
}

impl DispatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    // Records are never mutated in place, so a poisoned lock still guards a consistent Vec.
    fn lock(&self) -> MutexGuard<'_, Vec<DispatchRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record; returns its sequence number.
    pub fn append(&self, record: DispatchRecord) -> usize {
        let mut records = self.lock();
        records.push(record);
        records.len() - 1
    }

    /// Copy of every record in append order.
    pub fn snapshot(&self) -> Vec<DispatchRecord> {
        self.lock().clone()
    }

    /// Records for one task in append order.
    pub fn for_task(&self, task_id: &str) -> Vec<DispatchRecord> {
        self.lock()
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Number of attempts recorded for a task.
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.lock().iter().filter(|r| r.task_id == task_id).count() as u32
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
