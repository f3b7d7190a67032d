//! Typed error hierarchy for the conductor engine.
//!
//! One enum per subsystem:
//! - `GraphError`: task graph construction, fatal to the whole run
//! - `RegistryError`: capacity registry misuse and capacity limits
//! - `RouteError`: worker selection failures, recoverable via deferral
//! - `TaskError`: per-attempt task failures, subject to retry policy
//! - `RunError`: what aborts a run outright

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a task set into a phased graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cycle detected in task dependencies. Involved tasks: {tasks:?}")]
    CycleDetected { tasks: Vec<String> },

    #[error("Unknown dependency '{dependency}' in task '{task}': no task with that id exists")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task id must not be empty")]
    EmptyTaskId,
}

/// Errors from the capacity registry.
///
/// `WorkerNotFound` and `NotReserved` indicate a caller holding a stale or
/// invented reference and are treated as contract violations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Worker {0} not found")]
    WorkerNotFound(String),

    #[error("Worker {0} is already registered")]
    DuplicateWorker(String),

    #[error("Invalid worker {worker}: {reason}")]
    InvalidWorker { worker: String, reason: String },

    #[error("Worker {worker} is at capacity ({load}/{capacity})")]
    CapacityExceeded {
        worker: String,
        load: usize,
        capacity: usize,
    },

    #[error("Task {task} is already reserved on worker {worker}")]
    AlreadyReserved { worker: String, task: String },

    #[error("Task {task} holds no reservation on worker {worker}")]
    NotReserved { worker: String, task: String },

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

/// Errors from worker selection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("No eligible worker for capability '{capability}' (task {task})")]
    NoEligibleWorker { task: String, capability: String },

    #[error("All {eligible} eligible workers for task {task} are at capacity")]
    CapacityExceeded { task: String, eligible: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure of a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    #[error("Executor failure: {message}")]
    ExecutorFailure { message: String },

    #[error("No eligible worker for capability '{capability}' within the deferral window")]
    NoEligibleWorker { capability: String },
}

/// Errors that abort a run instead of being recorded in its report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    /// The task set was rejected before any dispatch
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The registry reported a contract violation mid-run
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
