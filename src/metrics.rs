//! Metrics aggregation.
//!
//! The [`MetricsAggregator`] is owned by the run loop and fed one immutable
//! [`DispatchRecord`] at a time. Nothing else writes to it; readers get a
//! [`MetricsSummary`] snapshot.

use crate::dag::state::duration_serde;
use crate::dispatch::{DispatchOutcome, DispatchRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-task attempt and timing totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub phase: usize,
    pub attempts: u32,
    pub failures: u32,
    pub cancelled: u32,
    /// Whether the latest attempt succeeded
    pub succeeded: bool,
    /// Time spent executing, summed over attempts
    #[serde(with = "duration_serde")]
    pub busy_time: Duration,
    /// Workers used, in attempt order
    pub workers: Vec<String>,
}

/// Per-phase counts and duration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub phase: usize,
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub cancelled: u32,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// Per-worker dispatch counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub dispatches: u32,
    pub successes: u32,
    pub failures: u32,
    #[serde(with = "duration_serde")]
    pub busy_time: Duration,
}

/// How evenly dispatches spread across the workers that received any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalance {
    pub workers: usize,
    pub mean: f64,
    pub stddev: f64,
    pub min: u32,
    pub max: u32,
    /// max / mean; 1.0 is perfectly even
    pub imbalance: f64,
}

impl LoadBalance {
    fn from_counts(counts: &[u32]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let n = counts.len() as f64;
        let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
        let variance = counts
            .iter()
            .map(|&c| (c as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        Self {
            workers: counts.len(),
            mean,
            stddev: variance.sqrt(),
            min,
            max,
            imbalance: if mean > 0.0 { max as f64 / mean } else { 0.0 },
        }
    }
}

/// Snapshot of everything aggregated so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub cancelled: u32,
    /// Attempts beyond the first, summed over tasks
    pub retries: u32,
    pub tasks: BTreeMap<String, TaskMetrics>,
    pub phases: Vec<PhaseMetrics>,
    pub workers: BTreeMap<String, WorkerMetrics>,
    pub load_balance: LoadBalance,
}

/// Single-owner accumulator of dispatch records.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    tasks: BTreeMap<String, TaskMetrics>,
    phases: BTreeMap<usize, PhaseMetrics>,
    workers: BTreeMap<String, WorkerMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn phase_entry(&mut self, phase: usize) -> &mut PhaseMetrics {
        self.phases.entry(phase).or_insert_with(|| PhaseMetrics {
            phase,
            ..Default::default()
        })
    }

    /// Fold one finished attempt into the totals.
    pub fn record(&mut self, record: &DispatchRecord) {
        let elapsed = record.duration();

        let task = self.tasks.entry(record.task_id.clone()).or_default();
        task.phase = record.phase;
        task.attempts += 1;
        task.busy_time += elapsed;
        task.workers.push(record.worker_id.clone());
        task.succeeded = record.outcome.is_success();

        let worker = self.workers.entry(record.worker_id.clone()).or_default();
        worker.dispatches += 1;
        worker.busy_time += elapsed;

        let phase = self.phases.entry(record.phase).or_insert_with(|| PhaseMetrics {
            phase: record.phase,
            ..Default::default()
        });
        phase.attempts += 1;

        match record.outcome {
            DispatchOutcome::Succeeded => {
                worker.successes += 1;
                phase.successes += 1;
            }
            DispatchOutcome::Failed { .. } => {
                task.failures += 1;
                worker.failures += 1;
                phase.failures += 1;
            }
            DispatchOutcome::Cancelled => {
                task.cancelled += 1;
                phase.cancelled += 1;
            }
        }
    }

    /// Record how long a phase ran, from start to resolution.
    pub fn phase_finished(&mut self, phase: usize, duration: Duration) {
        self.phase_entry(phase).duration = duration;
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskMetrics> {
        self.tasks.get(task_id)
    }

    pub fn summary(&self) -> MetricsSummary {
        let phases: Vec<PhaseMetrics> = self.phases.values().cloned().collect();
        let counts: Vec<u32> = self.workers.values().map(|w| w.dispatches).collect();

        MetricsSummary {
            total_attempts: phases.iter().map(|p| p.attempts).sum(),
            successes: phases.iter().map(|p| p.successes).sum(),
            failures: phases.iter().map(|p| p.failures).sum(),
            cancelled: phases.iter().map(|p| p.cancelled).sum(),
            retries: self
                .tasks
                .values()
                .map(|t| t.attempts.saturating_sub(1))
                .sum(),
            tasks: self.tasks.clone(),
            phases,
            workers: self.workers.clone(),
            load_balance: LoadBalance::from_counts(&counts),
        }
    }
}
