//! Run state and reports.
//!
//! This module provides the types a finished (or halted) run reports back:
//! the overall [`RunState`], one [`PhaseReport`] per phase and the
//! [`RunReport`] tying them to the dispatch log and metrics.

use crate::dag::scheduler::PhaseStatus;
use crate::dispatch::DispatchRecord;
use crate::errors::TaskError;
use crate::metrics::MetricsSummary;
use crate::router::Strategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Graph built, nothing dispatched yet
    #[default]
    Idle,
    Running,
    /// Every phase completed
    Completed,
    /// A phase failed and downstream phases were halted
    Failed,
    /// Stopped by an external cancellation
    Cancelled,
}

impl RunState {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Phase position
    pub phase: usize,
    pub status: PhaseStatus,
    /// Every task in the phase, in id order
    pub tasks: Vec<String>,
    pub succeeded: Vec<String>,
    /// Non-critical tasks given up on
    #[serde(default)]
    pub abandoned: Vec<String>,
    /// Tasks never dispatched because a dependency did not succeed
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    /// Tasks left unresolved when the phase was cancelled
    #[serde(default)]
    pub cancelled: Vec<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl PhaseReport {
    /// Create a report for a phase that never started.
    pub fn pending(phase: usize, tasks: Vec<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            tasks,
            succeeded: Vec::new(),
            abandoned: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Check if the phase completed with some tasks abandoned or skipped.
    pub fn is_partial(&self) -> bool {
        self.status.is_success() && !(self.abandoned.is_empty() && self.skipped.is_empty())
    }

    /// Tasks that did not succeed in a completed phase.
    pub fn partial_failures(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .abandoned
            .iter()
            .chain(self.skipped.iter())
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// The task whose failure halted the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub phase: usize,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Everything a run reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub state: RunState,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub phases: Vec<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task: Option<FailedTask>,
    /// Tasks that never received an attempt
    pub never_dispatched: Vec<String>,
    /// Attempts per task
    pub attempts: BTreeMap<String, u32>,
    pub records: Vec<DispatchRecord>,
    pub metrics: MetricsSummary,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Positions of phases that completed.
    pub fn completed_phases(&self) -> Vec<usize> {
        self.phases
            .iter()
            .filter(|p| p.status.is_success())
            .map(|p| p.phase)
            .collect()
    }

    /// Position of the phase that failed, if any.
    pub fn failed_phase(&self) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Failed)
            .map(|p| p.phase)
    }

    /// One-line human summary.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "Run {} {}: {}/{} phases complete, {} attempts ({} retries) in {:.1}s",
            &self.run_id.to_string()[..8],
            self.state,
            self.completed_phases().len(),
            self.phases.len(),
            self.metrics.total_attempts,
            self.metrics.retries,
            self.duration.as_secs_f64(),
        );
        if let Some(ref failed) = self.failed_task {
            line.push_str(&format!(
                "; task '{}' failed after {} attempt(s)",
                failed.task_id, failed.attempts
            ));
        }
        if !self.never_dispatched.is_empty() {
            line.push_str(&format!(
                "; never dispatched: {}",
                self.never_dispatched.join(", ")
            ));
        }
        line
    }
}

/// Tracks execution timing on the runtime clock.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: RunState, phases: Vec<PhaseReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            plan: None,
            state,
            strategy: Strategy::LeastLoaded,
            started_at: now,
            finished_at: now,
            duration: Duration::from_millis(1500),
            phases,
            failed_task: None,
            never_dispatched: Vec::new(),
            attempts: BTreeMap::new(),
            records: Vec::new(),
            metrics: MetricsSummary::default(),
        }
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Running.is_running());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[test]
    fn test_partial_phase() {
        let mut phase = PhaseReport::pending(0, vec!["a".into(), "b".into(), "c".into()]);
        phase.status = PhaseStatus::Complete;
        phase.succeeded = vec!["a".into()];
        assert!(!phase.is_partial());

        phase.abandoned = vec!["c".into()];
        phase.skipped = vec!["b".into()];
        assert!(phase.is_partial());
        assert_eq!(phase.partial_failures(), vec!["b", "c"]);
    }

    #[test]
    fn test_completed_and_failed_phases() {
        let mut p0 = PhaseReport::pending(0, vec!["a".into()]);
        p0.status = PhaseStatus::Complete;
        let mut p1 = PhaseReport::pending(1, vec!["b".into()]);
        p1.status = PhaseStatus::Failed;
        let p2 = PhaseReport::pending(2, vec!["c".into()]);

        let mut r = report(RunState::Failed, vec![p0, p1, p2]);
        r.failed_task = Some(FailedTask {
            task_id: "b".into(),
            phase: 1,
            attempts: 4,
            error: None,
        });
        r.never_dispatched = vec!["c".into()];

        assert!(!r.is_success());
        assert_eq!(r.completed_phases(), vec![0]);
        assert_eq!(r.failed_phase(), Some(1));
        let line = r.summary_line();
        assert!(line.contains("failed"));
        assert!(line.contains("task 'b' failed after 4 attempt(s)"));
        assert!(line.contains("never dispatched: c"));
    }

    #[test]
    fn test_report_serializes_durations_as_millis() {
        let r = report(RunState::Completed, Vec::new());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["state"], "completed");
        assert_eq!(json["strategy"], "least-loaded");
        assert!(json.get("failed_task").is_none());

        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }
}
