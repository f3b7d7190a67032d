//! Run loop: concurrent dispatch inside a phase, strict ordering across phases.
//!
//! Every ready task in the running phase is offered to the [`Router`]; each
//! reservation becomes a spawned attempt that reports back over an mpsc
//! channel. The loop itself is the single writer of phase and task state, the
//! retry coordinator and the metrics aggregator. Tasks that cannot be placed
//! are deferred and re-offered on the next tick or completion.
//!
//! A phase ends when nothing is queued or in flight. When a critical task
//! fails (or the run is cancelled) the phase's cancellation token fires,
//! queued tasks stay undispatched, and in-flight attempts are awaited and
//! recorded as cancelled. Downstream phases never start after a failure.

use crate::dag::builder::{GraphBuilder, TaskGraph, TaskIndex};
use crate::dag::scheduler::{PhaseScheduler, PhaseStatus, RunConfig};
use crate::dag::state::{ExecutionTimer, FailedTask, PhaseReport, RunReport, RunState};
use crate::dispatch::{DispatchLog, DispatchOutcome, DispatchRecord};
use crate::errors::{RegistryError, RouteError, RunError, TaskError};
use crate::metrics::MetricsAggregator;
use crate::retry::{MAX_RETRY_DELAY, RetryCoordinator, RetryDecision};
use crate::router::{Reservation, Router, Strategy};
use crate::task::Task;
use crate::worker::{ExecutionRequest, TaskExecutor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        phases: usize,
        tasks: usize,
        strategy: Strategy,
    },
    PhaseStarted {
        phase: usize,
        tasks: Vec<String>,
    },
    TaskDispatched {
        phase: usize,
        task: String,
        worker: String,
        attempt: u32,
    },
    /// An attempt ended; carries its immutable record
    TaskFinished {
        record: Box<DispatchRecord>,
    },
    TaskRetryScheduled {
        task: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    /// A task could not be placed and is waiting
    TaskDeferred {
        task: String,
        reason: String,
    },
    PhaseCompleted {
        report: Box<PhaseReport>,
    },
    RunCompleted {
        run_id: Uuid,
        state: RunState,
        summary: String,
    },
}

/// How long a timed-out attempt may keep its slot while it winds down.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// What a spawned attempt sends back.
struct Completion {
    index: TaskIndex,
    outcome: DispatchOutcome,
    output: serde_json::Value,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

struct InFlight {
    reservation: Reservation,
    attempt: u32,
}

struct Queued {
    index: TaskIndex,
    /// Earliest dispatch time (later than now while backing off)
    ready_at: Instant,
    /// First time no eligible worker existed
    no_worker_since: Option<Instant>,
    /// A deferral event has been emitted for the current wait
    announced: bool,
}

/// Loop state for the running phase.
struct PhaseRun {
    phase: usize,
    token: CancellationToken,
    queue: Vec<Queued>,
    in_flight: HashMap<TaskIndex, InFlight>,
    failed_task: Option<TaskIndex>,
    halted: bool,
    cancelled: bool,
    fatal: Option<RegistryError>,
}

impl PhaseRun {
    fn new(phase: usize, token: CancellationToken, ready: &[TaskIndex], now: Instant) -> Self {
        Self {
            phase,
            token,
            queue: ready
                .iter()
                .map(|&index| Queued {
                    index,
                    ready_at: now,
                    no_worker_since: None,
                    announced: false,
                })
                .collect(),
            in_flight: HashMap::new(),
            failed_task: None,
            halted: false,
            cancelled: false,
            fatal: None,
        }
    }

    fn halt(&mut self) {
        self.halted = true;
        self.token.cancel();
    }

    fn fail(&mut self, index: TaskIndex) {
        self.failed_task.get_or_insert(index);
        self.halt();
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.halt();
    }

    fn dequeue(&mut self, index: TaskIndex) {
        self.queue.retain(|q| q.index != index);
    }

    fn requeue(&mut self, index: TaskIndex, ready_at: Instant) {
        self.queue.push(Queued {
            index,
            ready_at,
            no_worker_since: None,
            announced: false,
        });
    }

    fn entry(&mut self, index: TaskIndex) -> Option<&mut Queued> {
        self.queue.iter_mut().find(|q| q.index == index)
    }

    /// Mark a queued task as waiting; true the first time for this wait.
    fn defer(&mut self, index: TaskIndex) -> bool {
        match self.entry(index) {
            Some(q) if !q.announced => {
                q.announced = true;
                true
            }
            _ => false,
        }
    }

    /// When the loop must wake up again to re-offer queued tasks.
    fn next_wakeup(&self, now: Instant, tick: Duration) -> Option<Instant> {
        self.queue
            .iter()
            .map(|q| if q.ready_at > now { q.ready_at } else { now + tick })
            .min()
    }
}

/// How the loop was woken.
enum Wake {
    Completed(Completion),
    Tick,
    Cancelled,
}

/// Drives a task graph through its phases.
pub struct PhaseRunner {
    router: Arc<Router>,
    executor: Arc<dyn TaskExecutor>,
    retry: RetryCoordinator,
    config: RunConfig,
    log: Arc<DispatchLog>,
    cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    plan: Option<String>,
}

impl PhaseRunner {
    pub fn new(
        router: Arc<Router>,
        executor: Arc<dyn TaskExecutor>,
        retry: RetryCoordinator,
        config: RunConfig,
    ) -> Self {
        Self {
            router,
            executor,
            retry,
            config,
            log: Arc::new(DispatchLog::new()),
            cancel: CancellationToken::new(),
            event_tx: None,
            plan: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Cancel the run when this token fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Append dispatch records to a shared log.
    pub fn with_dispatch_log(mut self, log: Arc<DispatchLog>) -> Self {
        self.log = log;
        self
    }

    /// Name the plan in the run report.
    pub fn with_plan_name(mut self, name: &str) -> Self {
        self.plan = Some(name.to_string());
        self
    }

    pub fn dispatch_log(&self) -> &Arc<DispatchLog> {
        &self.log
    }

    /// Validate the task set and run it.
    ///
    /// Graph errors abort before anything is dispatched.
    pub async fn run(&mut self, tasks: Vec<Task>) -> Result<RunReport, RunError> {
        let graph = GraphBuilder::new(tasks).build()?;
        self.run_graph(graph).await
    }

    /// Run an already validated graph.
    pub async fn run_graph(&mut self, graph: TaskGraph) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = ExecutionTimer::start();
        let first_record = self.log.len();

        let mut sched = PhaseScheduler::new(graph, self.config.clone());
        let mut metrics = MetricsAggregator::new();
        let phase_ids = sched.graph().phase_ids();

        info!(
            run_id = %run_id,
            phases = sched.phase_count(),
            tasks = sched.graph().len(),
            strategy = %self.router.strategy(),
            "Run started"
        );
        self.emit_event(RunEvent::RunStarted {
            run_id,
            phases: sched.phase_count(),
            tasks: sched.graph().len(),
            strategy: self.router.strategy(),
        })
        .await;

        let mut state = RunState::Running;
        let mut failed_task = None;
        let mut phases = Vec::with_capacity(sched.phase_count());

        for (phase, ids) in phase_ids.into_iter().enumerate() {
            if state == RunState::Running && self.cancel.is_cancelled() {
                state = RunState::Cancelled;
            }
            if state != RunState::Running {
                phases.push(PhaseReport::pending(phase, ids));
                continue;
            }

            let phase_timer = ExecutionTimer::start();
            let run = self.run_phase(&mut sched, &mut metrics, phase).await;
            if let Some(err) = run.fatal {
                error!(run_id = %run_id, phase, error = %err, "Run aborted");
                return Err(err.into());
            }

            let status = if run.cancelled && run.failed_task.is_none() {
                sched.abort_phase(phase);
                PhaseStatus::Failed
            } else {
                sched.finish_phase(phase)
            };
            let duration = phase_timer.elapsed();
            metrics.phase_finished(phase, duration);

            let report = sched.phase_report(phase, duration);
            info!(
                phase,
                status = %status,
                succeeded = report.succeeded.len(),
                abandoned = report.abandoned.len(),
                failed = report.failed.len(),
                duration_ms = duration.as_millis() as u64,
                "Phase resolved"
            );
            self.emit_event(RunEvent::PhaseCompleted {
                report: Box::new(report.clone()),
            })
            .await;
            phases.push(report);

            if run.cancelled {
                state = RunState::Cancelled;
            }
            if let Some(index) = run.failed_task {
                let state_of = sched.task_state(index);
                failed_task = Some(FailedTask {
                    task_id: sched.graph().tasks()[index].id.clone(),
                    phase,
                    attempts: state_of.map_or(0, |s| s.attempts),
                    error: state_of.and_then(|s| s.last_error.clone()),
                });
                state = RunState::Failed;
            }
        }

        if state == RunState::Running {
            state = RunState::Completed;
        }

        let attempts: BTreeMap<String, u32> = sched
            .graph()
            .tasks()
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), sched.task_state(i).map_or(0, |s| s.attempts)))
            .collect();

        let report = RunReport {
            run_id,
            plan: self.plan.clone(),
            state,
            strategy: self.router.strategy(),
            started_at,
            finished_at: Utc::now(),
            duration: timer.elapsed(),
            phases,
            failed_task,
            never_dispatched: sched.never_dispatched(),
            attempts,
            records: self.log.snapshot().split_off(first_record),
            metrics: metrics.summary(),
        };

        let summary = report.summary_line();
        match state {
            RunState::Completed => info!(run_id = %run_id, "{}", summary),
            _ => warn!(run_id = %run_id, "{}", summary),
        }
        self.emit_event(RunEvent::RunCompleted {
            run_id,
            state,
            summary,
        })
        .await;

        Ok(report)
    }

    async fn run_phase(
        &mut self,
        sched: &mut PhaseScheduler,
        metrics: &mut MetricsAggregator,
        phase: usize,
    ) -> PhaseRun {
        let ready = sched.start_phase(phase);
        let mut run = PhaseRun::new(phase, self.cancel.child_token(), &ready, Instant::now());

        let ids: Vec<String> = ready
            .iter()
            .map(|&i| sched.graph().tasks()[i].id.clone())
            .collect();
        info!(phase, tasks = ids.len(), "Phase started");
        self.emit_event(RunEvent::PhaseStarted { phase, tasks: ids })
            .await;

        let (tx, mut rx) = mpsc::channel::<Completion>(ready.len().max(1));

        loop {
            if !run.halted && self.cancel.is_cancelled() {
                run.cancel();
            }
            if !run.halted {
                self.dispatch_due(sched, &mut run, &tx).await;
            }
            if run.in_flight.is_empty() && (run.halted || run.queue.is_empty()) {
                break;
            }

            let wakeup = if run.halted {
                None
            } else {
                run.next_wakeup(Instant::now(), self.config.tick_interval)
            };
            let deadline = wakeup.unwrap_or_else(|| Instant::now() + self.config.tick_interval);
            let waiting = !run.in_flight.is_empty();
            let halted = run.halted;

            let wake = tokio::select! {
                Some(done) = rx.recv(), if waiting => Wake::Completed(done),
                _ = tokio::time::sleep_until(deadline), if wakeup.is_some() => Wake::Tick,
                _ = self.cancel.cancelled(), if !halted => Wake::Cancelled,
                else => Wake::Tick,
            };

            match wake {
                Wake::Completed(done) => self.finish_attempt(sched, metrics, &mut run, done).await,
                Wake::Tick => {}
                Wake::Cancelled => {
                    warn!(phase, in_flight = run.in_flight.len(), "Run cancelled");
                    run.cancel();
                }
            }
        }

        run
    }

    /// Offer every due task to the router, in dispatch order.
    async fn dispatch_due(
        &mut self,
        sched: &mut PhaseScheduler,
        run: &mut PhaseRun,
        tx: &mpsc::Sender<Completion>,
    ) {
        let now = Instant::now();
        let mut due: Vec<TaskIndex> = run
            .queue
            .iter()
            .filter(|q| q.ready_at <= now)
            .map(|q| q.index)
            .collect();
        sched.sort_for_dispatch(&mut due);

        for index in due {
            if run.halted {
                break;
            }
            let task = sched.graph().tasks()[index].clone();

            match self.router.route(&task) {
                Ok(reservation) => {
                    run.dequeue(index);
                    self.launch(sched, run, task, index, reservation, tx).await;
                }
                Err(RouteError::NoEligibleWorker { capability, .. }) => {
                    self.no_eligible_worker(sched, run, &task, index, capability, now)
                        .await;
                }
                Err(RouteError::CapacityExceeded { eligible, .. }) => {
                    if run.defer(index) {
                        debug!(task = %task.id, eligible, "All eligible workers busy; deferring");
                        self.emit_event(RunEvent::TaskDeferred {
                            task: task.id.clone(),
                            reason: format!("all {eligible} eligible workers at capacity"),
                        })
                        .await;
                    }
                }
                Err(RouteError::Registry(err)) => {
                    error!(task = %task.id, error = %err, "Registry failure while routing");
                    run.fatal.get_or_insert(err);
                    run.halt();
                }
            }
        }
    }

    async fn no_eligible_worker(
        &mut self,
        sched: &mut PhaseScheduler,
        run: &mut PhaseRun,
        task: &Task,
        index: TaskIndex,
        capability: String,
        now: Instant,
    ) {
        if self.config.phase_fatal_on_no_eligible_worker {
            warn!(task = %task.id, capability = %capability, "No eligible worker; failing phase");
            run.dequeue(index);
            sched.mark_failed(index, TaskError::NoEligibleWorker { capability });
            run.fail(index);
            return;
        }

        let since = match run.entry(index) {
            Some(q) => *q.no_worker_since.get_or_insert(now),
            None => now,
        };
        if now.duration_since(since) >= self.config.deferred_task_timeout {
            run.dequeue(index);
            let error = TaskError::NoEligibleWorker { capability };
            match self.retry.classify_exhausted(task) {
                RetryDecision::FailPhase => {
                    sched.mark_failed(index, error);
                    run.fail(index);
                }
                _ => sched.mark_abandoned(index, error),
            }
        } else if run.defer(index) {
            debug!(task = %task.id, capability = %capability, "No eligible worker; deferring");
            self.emit_event(RunEvent::TaskDeferred {
                task: task.id.clone(),
                reason: format!("no eligible worker for capability '{capability}'"),
            })
            .await;
        }
    }

    /// Per-attempt time limit: the tighter of the task timeout and its deadline.
    fn attempt_timeout(&self, task: &Task) -> Option<Duration> {
        let limit = task.timeout().or(self.config.task_timeout);
        let remaining = task
            .deadline
            .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        match (limit, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn launch(
        &mut self,
        sched: &mut PhaseScheduler,
        run: &mut PhaseRun,
        task: Task,
        index: TaskIndex,
        reservation: Reservation,
        tx: &mpsc::Sender<Completion>,
    ) {
        let attempt = sched.mark_dispatched(index, &reservation.worker_id);
        info!(
            phase = run.phase,
            task = %task.id,
            worker = %reservation.worker_id,
            attempt,
            "Task dispatched"
        );
        self.emit_event(RunEvent::TaskDispatched {
            phase: run.phase,
            task: task.id.clone(),
            worker: reservation.worker_id.clone(),
            attempt,
        })
        .await;

        let timeout = self.attempt_timeout(&task);
        let request = ExecutionRequest {
            deadline: task.deadline,
            task,
            worker_id: reservation.worker_id.clone(),
            attempt,
        };
        let executor = Arc::clone(&self.executor);
        let token = run.token.child_token();
        let tx = tx.clone();

        sched.mark_running(index);
        run.in_flight.insert(
            index,
            InFlight {
                reservation,
                attempt,
            },
        );

        tokio::spawn(async move {
            let completion = execute_attempt(executor, request, token, timeout, index).await;
            tx.send(completion).await.ok();
        });
    }

    /// Release the worker, record the attempt and decide what happens next.
    async fn finish_attempt(
        &mut self,
        sched: &mut PhaseScheduler,
        metrics: &mut MetricsAggregator,
        run: &mut PhaseRun,
        done: Completion,
    ) {
        let Some(flight) = run.in_flight.remove(&done.index) else {
            warn!(index = done.index, "Completion for a task that is not in flight");
            return;
        };
        let task = sched.graph().tasks()[done.index].clone();

        // Results arriving after the phase halted are discarded
        let outcome = if run.halted {
            DispatchOutcome::Cancelled
        } else {
            done.outcome
        };

        let released = match outcome {
            DispatchOutcome::Cancelled => self.router.release(&flight.reservation),
            ref o => self
                .router
                .complete(&flight.reservation, o.is_success())
                .map(|_| ()),
        };
        match released {
            Ok(()) => {}
            Err(RegistryError::WorkerNotFound(worker)) => {
                warn!(task = %task.id, worker = %worker, "Worker deregistered while task was in flight");
            }
            Err(err) => {
                error!(task = %task.id, error = %err, "Failed to release reservation");
                run.fatal.get_or_insert(err);
                run.halt();
            }
        }

        let record = DispatchRecord {
            task_id: task.id.clone(),
            worker_id: flight.reservation.worker_id.clone(),
            phase: run.phase,
            attempt: flight.attempt,
            started_at: done.started_at,
            ended_at: done.ended_at,
            outcome: outcome.clone(),
            output: done.output,
        };
        self.log.append(record.clone());
        metrics.record(&record);
        self.emit_event(RunEvent::TaskFinished {
            record: Box::new(record),
        })
        .await;

        match outcome {
            DispatchOutcome::Succeeded => {
                info!(task = %task.id, attempt = flight.attempt, "Task succeeded");
                sched.mark_succeeded(done.index);
            }
            DispatchOutcome::Cancelled => {
                debug!(task = %task.id, "Attempt cancelled");
                sched.mark_cancelled(done.index);
            }
            DispatchOutcome::Failed { error } => {
                warn!(task = %task.id, attempt = flight.attempt, error = %error, "Task attempt failed");
                match self.retry.on_failure(&task, flight.attempt, &error) {
                    RetryDecision::Retry {
                        delay,
                        next_attempt,
                    } => {
                        sched.mark_retry(done.index, error);
                        let now = Instant::now();
                        let ready_at = now
                            .checked_add(delay)
                            .or_else(|| now.checked_add(MAX_RETRY_DELAY))
                            .unwrap_or(now);
                        run.requeue(done.index, ready_at);
                        self.emit_event(RunEvent::TaskRetryScheduled {
                            task: task.id.clone(),
                            next_attempt,
                            delay_ms: delay.as_millis() as u64,
                        })
                        .await;
                    }
                    RetryDecision::Abandon => sched.mark_abandoned(done.index, error),
                    RetryDecision::FailPhase => {
                        sched.mark_failed(done.index, error);
                        run.fail(done.index);
                    }
                }
            }
        }
    }

    /// Emit an event to the event channel if configured.
    async fn emit_event(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Run one attempt under its time limit.
///
/// The executor runs in its own task so a panic surfaces as a failure
/// instead of a lost completion.
async fn execute_attempt(
    executor: Arc<dyn TaskExecutor>,
    request: ExecutionRequest,
    token: CancellationToken,
    timeout: Option<Duration>,
    index: TaskIndex,
) -> Completion {
    let started_at = Utc::now();
    let clock = Instant::now();
    let call_token = token.clone();
    let mut handle = tokio::spawn(async move { executor.execute(request, call_token).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                let elapsed_ms = clock.elapsed().as_millis() as u64;
                token.cancel();
                handle.abort();
                // The slot stays reserved until the aborted attempt has actually stopped
                if tokio::time::timeout(ABORT_GRACE, &mut handle).await.is_err() {
                    warn!(index, "Timed-out attempt still running after abort");
                }
                return Completion {
                    index,
                    outcome: DispatchOutcome::Failed {
                        error: TaskError::DeadlineExceeded { elapsed_ms },
                    },
                    output: serde_json::Value::Null,
                    started_at,
                    ended_at: Utc::now(),
                };
            }
        },
        None => handle.await,
    };

    let (outcome, output) = match joined {
        Ok(result) if result.is_success() => (DispatchOutcome::Succeeded, result.output),
        Ok(result) => (
            DispatchOutcome::Failed {
                error: TaskError::ExecutorFailure {
                    message: result
                        .error
                        .unwrap_or_else(|| "executor reported failure".to_string()),
                },
            },
            result.output,
        ),
        Err(e) => (
            DispatchOutcome::Failed {
                error: TaskError::ExecutorFailure {
                    message: format!("executor task ended abnormally: {e}"),
                },
            },
            serde_json::Value::Null,
        ),
    };

    Completion {
        index,
        outcome,
        output,
        started_at,
        ended_at: Utc::now(),
    }
}
