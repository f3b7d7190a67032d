//! Phase scheduler state.
//!
//! Tracks the state machine of every phase (Pending → Running →
//! {Complete, Failed}) and the status of every task. The run loop in
//! [`crate::dag::executor`] is the only writer; this module holds no locks and
//! does no I/O.

use crate::dag::builder::{GraphBuilder, TaskGraph, TaskIndex};
use crate::dag::state::PhaseReport;
use crate::errors::{GraphError, TaskError};
use crate::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default time a task may wait for an eligible worker to appear.
pub const DEFAULT_DEFERRED_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between scheduling passes while tasks are deferred.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Fail the phase as soon as a task has no eligible worker
    pub phase_fatal_on_no_eligible_worker: bool,
    /// How long a task may wait for an eligible worker before it counts as failed
    pub deferred_task_timeout: Duration,
    /// Per-attempt timeout for tasks that don't declare one
    pub task_timeout: Option<Duration>,
    /// Re-check interval for deferred tasks
    pub tick_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            phase_fatal_on_no_eligible_worker: false,
            deferred_task_timeout: DEFAULT_DEFERRED_TASK_TIMEOUT,
            task_timeout: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl RunConfig {
    pub fn with_phase_fatal_on_no_eligible_worker(mut self, fatal: bool) -> Self {
        self.phase_fatal_on_no_eligible_worker = fatal;
        self
    }

    pub fn with_deferred_task_timeout(mut self, timeout: Duration) -> Self {
        self.deferred_task_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase has not started (or never will, after an upstream failure)
    #[default]
    Pending,
    Running,
    /// Every task succeeded or was abandoned
    Complete,
    /// A critical task failed
    Failed,
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Running => write!(f, "running"),
            PhaseStatus::Complete => write!(f, "complete"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable per-task bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Attempts dispatched so far
    pub attempts: u32,
    /// Worker of the latest attempt
    pub worker: Option<String>,
    pub last_error: Option<TaskError>,
    /// Never dispatched because a dependency was abandoned
    pub skipped: bool,
}

/// Phase and task state for one run.
#[derive(Debug)]
pub struct PhaseScheduler {
    graph: TaskGraph,
    config: RunConfig,
    tasks: Vec<TaskState>,
    phases: Vec<PhaseStatus>,
    succeeded: HashSet<TaskIndex>,
}

impl PhaseScheduler {
    pub fn new(graph: TaskGraph, config: RunConfig) -> Self {
        let tasks = vec![TaskState::default(); graph.len()];
        let phases = vec![PhaseStatus::Pending; graph.phase_count()];
        Self {
            graph,
            config,
            tasks,
            phases,
            succeeded: HashSet::new(),
        }
    }

    /// Validate and layer a task set.
    pub fn from_tasks(tasks: Vec<Task>, config: RunConfig) -> Result<Self, GraphError> {
        let graph = GraphBuilder::new(tasks).build()?;
        Ok(Self::new(graph, config))
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn phase_status(&self, phase: usize) -> Option<PhaseStatus> {
        self.phases.get(phase).copied()
    }

    pub fn phase_statuses(&self) -> &[PhaseStatus] {
        &self.phases
    }

    pub fn task_state(&self, index: TaskIndex) -> Option<&TaskState> {
        self.tasks.get(index)
    }

    /// Status of a task by id.
    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.graph
            .get_index(id)
            .and_then(|i| self.tasks.get(i))
            .map(|t| t.status)
    }

    fn task_mut(&mut self, index: TaskIndex) -> Option<&mut TaskState> {
        self.tasks.get_mut(index)
    }

    /// Move a phase to Running and return its dispatchable tasks in dispatch order.
    ///
    /// Tasks with a dependency that did not succeed are marked Abandoned and
    /// skipped; they never reach Ready.
    pub fn start_phase(&mut self, phase: usize) -> Vec<TaskIndex> {
        let Some(members) = self.graph.phases().get(phase).cloned() else {
            return Vec::new();
        };
        self.phases[phase] = PhaseStatus::Running;

        let mut ready = Vec::with_capacity(members.len());
        for index in members {
            if self.graph.dependencies_satisfied(index, &self.succeeded) {
                if let Some(state) = self.task_mut(index) {
                    state.status = TaskStatus::Ready;
                }
                ready.push(index);
            } else if let Some(state) = self.task_mut(index) {
                state.status = TaskStatus::Abandoned;
                state.skipped = true;
            }
        }
        self.sort_for_dispatch(&mut ready);
        ready
    }

    /// Order tasks by descending priority, then ascending id.
    pub fn sort_for_dispatch(&self, indices: &mut [TaskIndex]) {
        indices.sort_by(|&a, &b| {
            let (ta, tb) = (&self.graph.tasks()[a], &self.graph.tasks()[b]);
            tb.priority.cmp(&ta.priority).then_with(|| ta.id.cmp(&tb.id))
        });
    }

    /// A worker was reserved; returns the new attempt number.
    pub fn mark_dispatched(&mut self, index: TaskIndex, worker: &str) -> u32 {
        match self.task_mut(index) {
            Some(state) => {
                state.status = TaskStatus::Dispatched;
                state.attempts += 1;
                state.worker = Some(worker.to_string());
                state.attempts
            }
            None => 0,
        }
    }

    pub fn mark_running(&mut self, index: TaskIndex) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Running;
        }
    }

    pub fn mark_succeeded(&mut self, index: TaskIndex) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Succeeded;
            self.succeeded.insert(index);
        }
    }

    /// Record a failed attempt that will be retried.
    pub fn mark_retry(&mut self, index: TaskIndex, error: TaskError) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Ready;
            state.last_error = Some(error);
        }
    }

    /// A cancelled attempt returns the task to Ready without counting as a failure.
    pub fn mark_cancelled(&mut self, index: TaskIndex) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Ready;
        }
    }

    pub fn mark_abandoned(&mut self, index: TaskIndex, error: TaskError) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Abandoned;
            state.last_error = Some(error);
        }
    }

    pub fn mark_failed(&mut self, index: TaskIndex, error: TaskError) {
        if let Some(state) = self.task_mut(index) {
            state.status = TaskStatus::Failed;
            state.last_error = Some(error);
        }
    }

    /// Resolve a phase once nothing in it is in flight.
    ///
    /// Failed if any task Failed, otherwise Complete.
    pub fn finish_phase(&mut self, phase: usize) -> PhaseStatus {
        let failed = self
            .graph
            .phases()
            .get(phase)
            .is_some_and(|members| {
                members
                    .iter()
                    .any(|&i| self.tasks[i].status == TaskStatus::Failed)
            });
        let status = if failed {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Complete
        };
        if let Some(slot) = self.phases.get_mut(phase) {
            *slot = status;
        }
        status
    }

    /// Mark a phase Failed without evaluating its tasks, after a run-level cancellation.
    pub fn abort_phase(&mut self, phase: usize) {
        if let Some(slot) = self.phases.get_mut(phase) {
            *slot = PhaseStatus::Failed;
        }
    }

    /// Ids of tasks that never received an attempt, in graph order.
    pub fn never_dispatched(&self) -> Vec<String> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, state)| state.attempts == 0)
            .map(|(i, _)| self.graph.tasks()[i].id.clone())
            .collect()
    }

    /// Ids of tasks in a phase with the given status.
    pub fn phase_tasks_with(&self, phase: usize, status: TaskStatus) -> Vec<String> {
        self.graph
            .phases()
            .get(phase)
            .map(|members| {
                members
                    .iter()
                    .filter(|&&i| self.tasks[i].status == status)
                    .map(|&i| self.graph.tasks()[i].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Summarise a phase from the current task states.
    pub fn phase_report(&self, phase: usize, duration: Duration) -> PhaseReport {
        let members = self.graph.phases().get(phase).cloned().unwrap_or_default();
        let mut report = PhaseReport::pending(
            phase,
            members
                .iter()
                .map(|&i| self.graph.tasks()[i].id.clone())
                .collect(),
        );
        report.status = self.phases.get(phase).copied().unwrap_or_default();
        report.duration = duration;

        for index in members {
            let id = self.graph.tasks()[index].id.clone();
            let state = &self.tasks[index];
            match state.status {
                TaskStatus::Succeeded => report.succeeded.push(id),
                TaskStatus::Abandoned if state.skipped => report.skipped.push(id),
                TaskStatus::Abandoned => report.abandoned.push(id),
                TaskStatus::Failed => report.failed.push(id),
                _ => report.cancelled.push(id),
            }
        }
        report
    }

    /// Check if every phase completed.
    pub fn all_complete(&self) -> bool {
        self.phases.iter().all(|p| p.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Criticality;

    fn failure() -> TaskError {
        TaskError::ExecutorFailure {
            message: "boom".into(),
        }
    }

    fn scheduler(tasks: Vec<Task>) -> PhaseScheduler {
        PhaseScheduler::from_tasks(tasks, RunConfig::default()).unwrap()
    }

    fn ids(s: &PhaseScheduler, indices: &[TaskIndex]) -> Vec<String> {
        indices
            .iter()
            .map(|&i| s.graph().tasks()[i].id.clone())
            .collect()
    }

    #[test]
    fn test_run_config_builders() {
        let config = RunConfig::default()
            .with_phase_fatal_on_no_eligible_worker(true)
            .with_deferred_task_timeout(Duration::from_secs(5))
            .with_task_timeout(Duration::from_secs(60))
            .with_tick_interval(Duration::from_millis(10));
        assert!(config.phase_fatal_on_no_eligible_worker);
        assert_eq!(config.deferred_task_timeout, Duration::from_secs(5));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_start_phase_orders_by_priority_then_id() {
        let mut s = scheduler(vec![
            Task::new("c", "x"),
            Task::new("a", "x"),
            Task::new("b", "x").with_priority(5),
        ]);
        let ready = s.start_phase(0);
        assert_eq!(ids(&s, &ready), vec!["b", "a", "c"]);
        assert_eq!(s.phase_status(0), Some(PhaseStatus::Running));
        assert_eq!(s.status_of("a"), Some(TaskStatus::Ready));
    }

    #[test]
    fn test_phase_complete_when_all_succeed() {
        let mut s = scheduler(vec![Task::new("a", "x"), Task::new("b", "x")]);
        for i in s.start_phase(0) {
            assert_eq!(s.mark_dispatched(i, "w1"), 1);
            s.mark_running(i);
            assert_eq!(s.task_state(i).unwrap().status, TaskStatus::Running);
            s.mark_succeeded(i);
        }
        assert_eq!(s.phase_tasks_with(0, TaskStatus::Succeeded).len(), 2);
        assert_eq!(s.finish_phase(0), PhaseStatus::Complete);
        assert!(s.all_complete());
    }

    #[test]
    fn test_abandoned_task_leaves_phase_complete() {
        let mut s = scheduler(vec![
            Task::new("a", "x"),
            Task::new("b", "x").with_criticality(Criticality::NonCritical),
        ]);
        s.start_phase(0);
        let (a, b) = (s.graph().get_index("a").unwrap(), s.graph().get_index("b").unwrap());
        s.mark_dispatched(a, "w1");
        s.mark_succeeded(a);
        s.mark_dispatched(b, "w1");
        s.mark_abandoned(b, failure());

        assert_eq!(s.finish_phase(0), PhaseStatus::Complete);
        assert_eq!(s.phase_tasks_with(0, TaskStatus::Abandoned), vec!["b"]);
        assert_eq!(s.task_state(b).unwrap().last_error, Some(failure()));
    }

    #[test]
    fn test_failed_task_fails_phase_and_downstream_never_dispatched() {
        let mut s = scheduler(vec![
            Task::new("a", "x"),
            Task::new("b", "x").with_deps(&["a"]),
            Task::new("c", "x").with_deps(&["b"]),
        ]);
        let ready = s.start_phase(0);
        s.mark_dispatched(ready[0], "w1");
        s.mark_failed(ready[0], failure());

        assert_eq!(s.finish_phase(0), PhaseStatus::Failed);
        assert_eq!(s.phase_status(1), Some(PhaseStatus::Pending));
        assert_eq!(s.never_dispatched(), vec!["b", "c"]);
        assert!(!s.all_complete());
    }

    #[test]
    fn test_dependents_of_abandoned_task_are_skipped() {
        let mut s = scheduler(vec![
            Task::new("a", "x").with_criticality(Criticality::NonCritical),
            Task::new("b", "x"),
            Task::new("c", "x").with_deps(&["a"]),
            Task::new("d", "x").with_deps(&["b"]),
        ]);
        s.start_phase(0);
        let a = s.graph().get_index("a").unwrap();
        let b = s.graph().get_index("b").unwrap();
        s.mark_dispatched(a, "w1");
        s.mark_abandoned(a, failure());
        s.mark_dispatched(b, "w1");
        s.mark_succeeded(b);
        assert_eq!(s.finish_phase(0), PhaseStatus::Complete);

        let ready = s.start_phase(1);
        assert_eq!(ids(&s, &ready), vec!["d"]);
        let c = s.graph().get_index("c").unwrap();
        assert_eq!(s.status_of("c"), Some(TaskStatus::Abandoned));
        assert!(s.task_state(c).unwrap().skipped);
        assert_eq!(s.never_dispatched(), vec!["c", "d"]);
    }

    #[test]
    fn test_retry_returns_task_to_ready() {
        let mut s = scheduler(vec![Task::new("a", "x")]);
        let a = s.start_phase(0)[0];
        s.mark_dispatched(a, "w1");
        s.mark_retry(a, failure());
        assert_eq!(s.status_of("a"), Some(TaskStatus::Ready));
        assert_eq!(s.mark_dispatched(a, "w2"), 2);
        assert_eq!(s.task_state(a).unwrap().worker.as_deref(), Some("w2"));
    }

    #[test]
    fn test_phase_report_buckets_tasks() {
        let mut s = scheduler(vec![
            Task::new("a", "x"),
            Task::new("b", "x").with_criticality(Criticality::NonCritical),
            Task::new("c", "x"),
            Task::new("d", "x"),
        ]);
        s.start_phase(0);
        let idx = |s: &PhaseScheduler, id: &str| s.graph().get_index(id).unwrap();
        let (a, b, c) = (idx(&s, "a"), idx(&s, "b"), idx(&s, "c"));
        s.mark_dispatched(a, "w1");
        s.mark_succeeded(a);
        s.mark_dispatched(b, "w1");
        s.mark_abandoned(b, failure());
        s.mark_dispatched(c, "w1");
        s.mark_failed(c, failure());
        s.finish_phase(0);

        let report = s.phase_report(0, Duration::from_secs(2));
        assert_eq!(report.status, PhaseStatus::Failed);
        assert_eq!(report.tasks, vec!["a", "b", "c", "d"]);
        assert_eq!(report.succeeded, vec!["a"]);
        assert_eq!(report.abandoned, vec!["b"]);
        assert_eq!(report.failed, vec!["c"]);
        assert_eq!(report.cancelled, vec!["d"]);
        assert_eq!(report.duration, Duration::from_secs(2));
    }

    #[test]
    fn test_abort_phase() {
        let mut s = scheduler(vec![Task::new("a", "x")]);
        s.start_phase(0);
        s.abort_phase(0);
        assert_eq!(s.phase_status(0), Some(PhaseStatus::Failed));
        assert_eq!(s.status_of("a"), Some(TaskStatus::Ready));
    }

    #[test]
    fn test_phase_status_terminal() {
        assert!(!PhaseStatus::Pending.is_terminal());
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Complete.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert_eq!(PhaseStatus::Complete.to_string(), "complete");
    }
}
