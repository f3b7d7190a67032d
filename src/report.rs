//! Run reports on disk and live event output.

use crate::dag::executor::RunEvent;
use crate::dag::state::RunReport;
use crate::dispatch::DispatchOutcome;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Persists finished runs as `<started_at>_<run id prefix>.json`.
pub struct ReportWriter {
    report_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(report_dir: &Path) -> Self {
        Self {
            report_dir: report_dir.to_path_buf(),
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Write a report, creating the directory if needed. Returns the file path.
    pub fn write(&self, report: &RunReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.report_dir).with_context(|| {
            format!(
                "Failed to create report directory: {}",
                self.report_dir.display()
            )
        })?;

        let filename = format!(
            "{}_{}.json",
            report.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &report.run_id.to_string()[..8]
        );
        let path = self.report_dir.join(filename);

        let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        Ok(path)
    }

    /// Report files, most recent first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.report_dir.exists() {
            return Ok(Vec::new());
        }

        let mut reports: Vec<PathBuf> = fs::read_dir(&self.report_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        reports.sort();
        reports.reverse();
        Ok(reports)
    }

    pub fn load(&self, path: &Path) -> Result<RunReport> {
        let content = fs::read_to_string(path).context("Failed to read run report")?;
        serde_json::from_str(&content).context("Failed to parse run report")
    }
}

/// Render an event as one line of human-readable progress.
pub fn format_event(event: &RunEvent) -> String {
    match event {
        RunEvent::RunStarted {
            run_id,
            phases,
            tasks,
            strategy,
        } => format!(
            "run {} started: {} task(s) in {} phase(s), strategy {}",
            &run_id.to_string()[..8],
            tasks,
            phases,
            strategy
        ),
        RunEvent::PhaseStarted { phase, tasks } => {
            format!("phase {} started: {}", phase, tasks.join(", "))
        }
        RunEvent::TaskDispatched {
            task,
            worker,
            attempt,
            ..
        } => format!("  {} -> {} (attempt {})", task, worker, attempt),
        RunEvent::TaskFinished { record } => {
            let ms = record.duration().as_millis();
            match &record.outcome {
                DispatchOutcome::Succeeded => {
                    format!("  {} ok on {} in {}ms", record.task_id, record.worker_id, ms)
                }
                DispatchOutcome::Failed { error } => format!(
                    "  {} failed on {} in {}ms: {}",
                    record.task_id, record.worker_id, ms, error
                ),
                DispatchOutcome::Cancelled => {
                    format!("  {} cancelled on {}", record.task_id, record.worker_id)
                }
            }
        }
        RunEvent::TaskRetryScheduled {
            task,
            next_attempt,
            delay_ms,
        } => format!(
            "  {} retry as attempt {} in {}ms",
            task, next_attempt, delay_ms
        ),
        RunEvent::TaskDeferred { task, reason } => format!("  {} waiting: {}", task, reason),
        RunEvent::PhaseCompleted { report } => {
            let mut line = format!(
                "phase {} {}: {}/{} succeeded in {:.1}s",
                report.phase,
                report.status,
                report.succeeded.len(),
                report.tasks.len(),
                report.duration.as_secs_f64()
            );
            if report.is_partial() {
                line.push_str(&format!(
                    " (did not succeed: {})",
                    report.partial_failures().join(", ")
                ));
            }
            line
        }
        RunEvent::RunCompleted { summary, .. } => summary.clone(),
    }
}

/// Drain run events onto stderr until the sender side closes.
///
/// With `json` set, each event is printed as one JSON object per line.
pub fn spawn_event_printer(mut rx: mpsc::Receiver<RunEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize run event"),
                }
            } else {
                eprintln!("{}", format_event(&event));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::scheduler::PhaseStatus;
    use crate::dag::state::{PhaseReport, RunState};
    use crate::dispatch::DispatchRecord;
    use crate::errors::TaskError;
    use crate::metrics::MetricsSummary;
    use crate::router::Strategy;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn make_report(hour: u32) -> RunReport {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap();
        RunReport {
            run_id: Uuid::new_v4(),
            plan: Some("nightly".into()),
            state: RunState::Completed,
            strategy: Strategy::RoundRobin,
            started_at,
            finished_at: started_at,
            duration: Duration::from_secs(2),
            phases: vec![PhaseReport::pending(0, vec!["a".into()])],
            failed_task: None,
            never_dispatched: Vec::new(),
            attempts: BTreeMap::from([("a".to_string(), 1)]),
            records: Vec::new(),
            metrics: MetricsSummary::default(),
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(&dir.path().join("runs"));

        let report = make_report(9);
        let path = writer.write(&report).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("2026-03-01T09-00-00_"));
        assert!(name.ends_with(".json"));

        let loaded = writer.load(&path).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.plan.as_deref(), Some("nightly"));
        assert_eq!(loaded.attempts["a"], 1);
    }

    #[test]
    fn test_list_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        assert!(ReportWriter::new(&dir.path().join("missing")).list().unwrap().is_empty());

        let older = writer.write(&make_report(8)).unwrap();
        let newer = writer.write(&make_report(10)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(writer.list().unwrap(), vec![newer, older]);
    }

    #[test]
    fn test_format_events() {
        let started_at = Utc::now();
        let record = DispatchRecord {
            task_id: "build".into(),
            worker_id: "w1".into(),
            phase: 0,
            attempt: 2,
            started_at,
            ended_at: started_at,
            outcome: DispatchOutcome::Failed {
                error: TaskError::ExecutorFailure {
                    message: "boom".into(),
                },
            },
            output: serde_json::Value::Null,
        };
        let line = format_event(&RunEvent::TaskFinished {
            record: Box::new(record),
        });
        assert!(line.contains("build failed on w1"));
        assert!(line.contains("boom"));

        let line = format_event(&RunEvent::TaskDispatched {
            phase: 0,
            task: "build".into(),
            worker: "w1".into(),
            attempt: 1,
        });
        assert_eq!(line, "  build -> w1 (attempt 1)");

        let mut phase = PhaseReport::pending(1, vec!["a".into(), "b".into()]);
        phase.status = PhaseStatus::Complete;
        phase.succeeded = vec!["a".into()];
        phase.abandoned = vec!["b".into()];
        let line = format_event(&RunEvent::PhaseCompleted {
            report: Box::new(phase),
        });
        assert!(line.starts_with("phase 1 complete: 1/2 succeeded"));
        assert!(line.contains("did not succeed: b"));
    }

    #[tokio::test]
    async fn test_event_printer_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_event_printer(rx, true);
        tx.send(RunEvent::TaskDeferred {
            task: "a".into(),
            reason: "no capacity".into(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
