//! DAG scheduling for phased task execution.
//!
//! Tasks declare dependencies on other tasks; the graph is split into phases
//! (Kahn layers) and phases run strictly in order. Inside a phase every task
//! may run in parallel, bounded by worker capacity.
//!
//! ## Architecture
//!
//! 1. **Builder** - Validates tasks and layers them into phases
//! 2. **Scheduler** - Owns per-task and per-phase state transitions
//! 3. **Executor** - Runs phases: routing, dispatch, retries, cancellation
//!
//! ## Example
//!
//! ```no_run
//! use conductor::dag::GraphBuilder;
//! use conductor::task::Task;
//!
//! # fn example() -> anyhow::Result<()> {
//! let tasks = vec![
//!     Task::new("fetch", "net"),
//!     Task::new("build", "rust").with_deps(&["fetch"]),
//!     Task::new("lint", "rust").with_deps(&["fetch"]),
//!     Task::new("package", "shell").with_deps(&["build", "lint"]),
//! ];
//!
//! let graph = GraphBuilder::new(tasks).build()?;
//! // Phase 0: [fetch]
//! // Phase 1: [build, lint]
//! // Phase 2: [package]
//! assert_eq!(graph.phase_count(), 3);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod executor;
pub mod scheduler;
pub mod state;

pub use builder::{GraphBuilder, TaskGraph, TaskIndex};
pub use executor::{PhaseRunner, RunEvent};
pub use scheduler::{PhaseScheduler, PhaseStatus, RunConfig, TaskState};
pub use state::{ExecutionTimer, FailedTask, PhaseReport, RunReport, RunState};
