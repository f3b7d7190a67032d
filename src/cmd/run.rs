//! Plan execution: `conductor run <file>`.

use anyhow::{Context, Result};
use conductor::config::ConductorToml;
use conductor::dag::{PhaseRunner, RunReport};
use conductor::registry::{CapacityRegistry, WorkerSpec};
use conductor::report::{ReportWriter, spawn_event_printer};
use conductor::task::{PlanFile, Task};
use conductor::worker::{DryRunExecutor, TaskExecutor};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Worker registered for dry runs when the configuration lists none.
const DRY_RUN_WORKER: &str = "dry-run";

pub struct RunOptions {
    pub plan: PathBuf,
    pub config: Option<PathBuf>,
    pub strategy: Option<String>,
    pub max_attempts: Option<u32>,
    pub dry_run: bool,
    pub json: bool,
}

/// Load config with file → env → CLI precedence.
fn load_config(project_dir: &Path, options: &RunOptions) -> Result<ConductorToml> {
    let mut config = match &options.config {
        Some(path) => ConductorToml::load(path)?,
        None => ConductorToml::load_or_default(project_dir)?,
    };
    config.apply_env_overrides()?;

    if let Some(strategy) = &options.strategy {
        config.routing.strategy = strategy.parse()?;
    }
    if let Some(max_attempts) = options.max_attempts {
        config.retry.max_attempts = max_attempts;
    }

    for warning in config.validate() {
        warn!("{}", warning);
    }
    Ok(config)
}

/// One worker advertising every capability the plan uses, sized to run the whole plan at once.
fn register_dry_run_worker(registry: &CapacityRegistry, tasks: &[Task]) -> Result<()> {
    let capabilities: BTreeSet<&str> = tasks.iter().map(|t| t.capability.as_str()).collect();
    let capabilities: Vec<&str> = capabilities.into_iter().collect();
    let weight = tasks.len().max(1) as f64 / registry.oversubscription_factor().max(f64::EPSILON);
    registry
        .register(WorkerSpec::new(DRY_RUN_WORKER, &capabilities, weight.ceil()))
        .context("Failed to register dry-run worker")?;
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    for phase in &report.phases {
        println!(
            "Phase {}: {} ({}/{} succeeded)",
            phase.phase,
            phase.status,
            phase.succeeded.len(),
            phase.tasks.len()
        );
        if !phase.abandoned.is_empty() {
            println!("  abandoned: {}", phase.abandoned.join(", "));
        }
        if !phase.skipped.is_empty() {
            println!("  skipped: {}", phase.skipped.join(", "));
        }
        if !phase.failed.is_empty() {
            println!("  failed: {}", phase.failed.join(", "));
        }
    }

    let balance = &report.metrics.load_balance;
    if balance.workers > 0 {
        println!(
            "Load balance: {} worker(s), mean {:.1} dispatches, stddev {:.2}",
            balance.workers, balance.mean, balance.stddev
        );
    }
    println!();
    println!("{}", report.summary_line());
}

/// Run a plan file. Returns whether every phase completed.
pub async fn cmd_run(project_dir: &Path, options: RunOptions) -> Result<bool> {
    let plan = PlanFile::load(&options.plan)?;
    let config = load_config(project_dir, &options)?;

    let registry = config
        .build_registry()
        .context("Failed to register configured workers")?;
    if options.dry_run && registry.is_empty() {
        register_dry_run_worker(&registry, &plan.tasks)?;
    }
    let router = Arc::new(config.build_router(registry));

    let executor: Arc<dyn TaskExecutor> = if options.dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(config.build_command_executor(project_dir))
    };

    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_event_printer(rx, options.json);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling run");
                cancel.cancel();
            }
        })
    };

    let mut runner = PhaseRunner::new(router, executor, config.build_retry(), config.run_config())
        .with_event_channel(tx)
        .with_cancellation(cancel);
    let plan_name = plan
        .name
        .clone()
        .unwrap_or_else(|| options.plan.display().to_string());
    runner = runner.with_plan_name(&plan_name);

    let result = runner.run(plan.tasks).await;

    // Closing the event channel lets the printer drain and exit.
    drop(runner);
    ctrl_c.abort();
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer stopped abnormally");
    }

    let report = result.context("Run aborted")?;

    if let Some(dir) = &config.reporting.report_dir {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            project_dir.join(dir)
        };
        let path = ReportWriter::new(&dir).write(&report)?;
        info!(path = %path.display(), "Run report written");
    }

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
        );
    } else {
        print_report(&report);
    }

    Ok(report.is_success())
}
