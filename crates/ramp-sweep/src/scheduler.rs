//! Speculative sweep scheduler for a single experiment.
//!
//! The dispatch loop keeps up to `speculation_limit` evaluations in flight
//! ahead of the frontier. The first worker to complete with
//! `metric >= threshold` sets the one-way stop flag; the loop then exits,
//! cancels the stragglers still registered and waits for every worker to
//! reach a terminal state before the report is assembled.
//!
//! Whichever exceeding worker completes first is authoritative, even when a
//! lower parameter would also have crossed the threshold had it finished
//! sooner.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use ramp_log::{messages, ExperimentLog, ProgressLog};
use ramp_types::{
    EvaluationError, ExperimentConfig, ExperimentReport, ExperimentSummary, Measurement,
    ParameterPoint, StragglerPolicy, SweepError, SweepStats, SweepStatus,
};

use crate::cancel::CancelToken;
use crate::collector::{MeasurementSink, ResultCollector};
use crate::evaluator::{EvaluationRequest, Evaluator};
use crate::gate::{SlotPermit, WorkerSlotGate};
use crate::registry::{Registration, SharedSweepState, StopReason, SweepState, WorkerHandle};

/// Tunables that are not part of an experiment's configuration.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How long cancelled stragglers get to wind down before their tasks are
    /// aborted.
    pub cancel_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(10),
        }
    }
}

/// Runs one experiment's sweep against an [`Evaluator`].
pub struct SweepScheduler {
    evaluator: Arc<dyn Evaluator>,
    progress: Arc<ProgressLog>,
    options: SchedulerOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Stopped,
    Exhausted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl Tally {
    fn record(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Completed => self.completed += 1,
            WorkerOutcome::Failed => self.failed += 1,
            WorkerOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Shared by every worker of one sweep.
struct WorkerContext {
    evaluator: Arc<dyn Evaluator>,
    config: Arc<ExperimentConfig>,
    state: SharedSweepState,
    gate: WorkerSlotGate,
    sink: MeasurementSink,
    log: ExperimentLog,
}

/// Abort handles of dispatched workers. Only workers that were asked to
/// cancel are ever aborted, and only once their grace has run out.
#[derive(Default)]
struct TaskHandles {
    running: HashMap<u64, AbortHandle>,
    cancelled: Vec<AbortHandle>,
    deadline: Option<Instant>,
}

impl TaskHandles {
    fn insert(&mut self, index: u64, handle: AbortHandle) {
        self.running.retain(|_, handle| !handle.is_finished());
        self.running.insert(index, handle);
    }

    /// Start the grace period for the workers at `indices`.
    fn mark_cancelled(&mut self, indices: &[u64], grace: Duration) {
        for index in indices {
            if let Some(handle) = self.running.remove(index) {
                self.cancelled.push(handle);
            }
        }
        if !self.cancelled.is_empty() {
            self.deadline.get_or_insert_with(|| Instant::now() + grace);
        }
    }

    /// Abort cancelled workers that are still running; returns how many.
    fn abort_cancelled(&mut self) -> usize {
        self.deadline = None;
        let mut aborted = 0;
        for handle in self.cancelled.drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

/// A worker's hold on the sweep. Fields drop in order, so the worker is
/// deregistered before its permit goes back to the gate.
struct WorkerSlot {
    registration: Registration,
    permit: SlotPermit,
}

impl SweepScheduler {
    pub fn new(evaluator: Arc<dyn Evaluator>, progress: Arc<ProgressLog>) -> Self {
        Self {
            evaluator,
            progress,
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn progress(&self) -> &Arc<ProgressLog> {
        &self.progress
    }

    /// Sweep `config` to completion.
    ///
    /// Fails only for an invalid configuration or when `shutdown` fires
    /// before the sweep finishes; evaluator failures stay local to the
    /// worker that hit them.
    pub async fn run(
        &self,
        config: &ExperimentConfig,
        shutdown: &CancelToken,
    ) -> Result<ExperimentReport, SweepError> {
        config.validate()?;
        let grid = config.sweep.grid()?;
        let started = Instant::now();

        let log = self.progress.experiment(&config.name);
        let state: SharedSweepState = Arc::new(Mutex::new(SweepState::new()));
        let gate = WorkerSlotGate::new(config.sweep.speculation_limit);
        let collector = ResultCollector::new();
        let ctx = Arc::new(WorkerContext {
            evaluator: Arc::clone(&self.evaluator),
            config: Arc::new(config.clone()),
            state: Arc::clone(&state),
            gate: gate.clone(),
            sink: collector.sink(),
            log: log.clone(),
        });
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut handles = TaskHandles::default();

        info!(
            experiment = %config.name,
            evaluator = %self.evaluator.name(),
            start = config.sweep.first_value(),
            delta = config.sweep.delta,
            threshold = config.sweep.threshold,
            speculation_limit = config.sweep.speculation_limit,
            "sweep started"
        );
        log.log("started");

        let exit = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break LoopExit::Shutdown,
                // The stopping worker closes the gate.
                permit = gate.acquire() => match permit {
                    Some(permit) => permit,
                    None => break LoopExit::Stopped,
                },
            };

            let (point, cancel) = {
                let mut s = state.lock();
                if s.is_stopped() {
                    break LoopExit::Stopped;
                }
                if config
                    .sweep
                    .max_points
                    .is_some_and(|max| s.dispatched() >= max)
                {
                    break LoopExit::Exhausted;
                }
                let point = s.next_point(&grid);
                let cancel = CancelToken::new();
                s.registry_mut()
                    .register(WorkerHandle::new(point, cancel.clone()));
                (point, cancel)
            };

            debug!(experiment = %config.name, parameter = %point, index = point.index, "dispatching worker");
            let slot = WorkerSlot {
                registration: Registration::new(Arc::clone(&state), point.index),
                permit,
            };
            let handle = workers.spawn(run_worker(Arc::clone(&ctx), point, cancel, slot));
            handles.insert(point.index, handle);
        };

        log.log(messages::EXITED);
        info!(experiment = %config.name, reason = ?exit, in_flight = workers.len(), "dispatch loop exited");

        let grace = self.options.cancel_grace;
        let mut aborted = false;
        let stragglers_cancelled = match exit {
            LoopExit::Stopped => {
                let cancelled =
                    self.cancel_stragglers(&state, config.sweep.straggler_policy, &log, false);
                handles.mark_cancelled(&cancelled, grace);
                true
            }
            LoopExit::Shutdown => {
                aborted = true;
                let cancelled =
                    self.cancel_stragglers(&state, config.sweep.straggler_policy, &log, true);
                handles.mark_cancelled(&cancelled, grace);
                true
            }
            LoopExit::Exhausted => false,
        };

        let tally = self
            .drain_workers(
                &mut workers,
                &mut handles,
                &state,
                config,
                &log,
                shutdown,
                stragglers_cancelled,
                &mut aborted,
            )
            .await;

        let (dispatched, stop) = {
            let s = state.lock();
            debug_assert!(s.registry().is_empty());
            (s.dispatched(), s.stop_reason())
        };
        drop(ctx);
        let measurements = collector.drain();

        log.log(format!("done. generated {} measurements.", measurements.len()));

        if aborted {
            warn!(experiment = %config.name, measurements = measurements.len(), "sweep shut down");
            return Err(SweepError::Shutdown {
                experiment: config.name.clone(),
            });
        }

        let (status, stopped_at) = match stop {
            Some(StopReason::ThresholdReached { point, .. }) => (
                SweepStatus::ThresholdReached {
                    parameter: point.as_f64(),
                },
                Some(point.as_f64()),
            ),
            Some(StopReason::Shutdown) | None => (SweepStatus::Exhausted, None),
        };

        let stats = SweepStats {
            dispatched,
            completed: tally.completed,
            failed: tally.failed,
            cancelled: tally.cancelled,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            stopped_at,
        };

        info!(
            experiment = %config.name,
            status = ?status,
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "sweep finished"
        );

        Ok(ExperimentReport::new(
            ExperimentSummary::from(config),
            status,
            measurements,
            stats,
        ))
    }

    /// Cancel registered workers under the sweep lock and return the dispatch
    /// indices of those cancelled. With `all` unset, the straggler policy
    /// decides which.
    fn cancel_stragglers(
        &self,
        state: &SharedSweepState,
        policy: StragglerPolicy,
        log: &ExperimentLog,
        all: bool,
    ) -> Vec<u64> {
        let stragglers = {
            let mut s = state.lock();
            if all {
                s.request_stop(StopReason::Shutdown);
            }
            let above = match (all, policy, s.stop_reason()) {
                (false, StragglerPolicy::CancelAbove, Some(StopReason::ThresholdReached { point, .. })) => {
                    Some(point.index)
                }
                _ => None,
            };
            let stragglers = s.registry().stragglers(above);
            for handle in &stragglers {
                handle.cancel();
            }
            stragglers
        };

        for handle in &stragglers {
            log.log(format!("terminating worker {}", handle.point()));
            debug!(
                experiment = %log.name(),
                parameter = %handle.point(),
                running_for = ?handle.running_for(),
                "cancelling straggler"
            );
        }
        log.log(format!("terminated {} stragglers.", stragglers.len()));
        stragglers.iter().map(WorkerHandle::index).collect()
    }

    /// Wait for every worker to reach a terminal state.
    ///
    /// Stragglers are cancelled here if a worker crosses the threshold after
    /// the loop has already exited, and everything is cancelled if `shutdown`
    /// fires. Cancelled workers get `cancel_grace` before their tasks are
    /// aborted; workers nobody asked to cancel are always awaited.
    #[allow(clippy::too_many_arguments)]
    async fn drain_workers(
        &self,
        workers: &mut JoinSet<WorkerOutcome>,
        handles: &mut TaskHandles,
        state: &SharedSweepState,
        config: &ExperimentConfig,
        log: &ExperimentLog,
        shutdown: &CancelToken,
        mut stragglers_cancelled: bool,
        aborted: &mut bool,
    ) -> Tally {
        let grace = self.options.cancel_grace;
        let mut tally = Tally::default();

        while !workers.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !*aborted => {
                    *aborted = true;
                    stragglers_cancelled = true;
                    let cancelled =
                        self.cancel_stragglers(state, config.sweep.straggler_policy, log, true);
                    handles.mark_cancelled(&cancelled, grace);
                    continue;
                }
                _ = wait_until(handles.deadline) => {
                    let remaining = handles.abort_cancelled();
                    if remaining > 0 {
                        warn!(
                            experiment = %config.name,
                            remaining,
                            grace = ?grace,
                            "workers ignored cancellation, aborting"
                        );
                        log.log(format!("forcing {remaining} workers down"));
                    }
                    continue;
                }
                joined = workers.join_next() => joined,
            };

            let Some(joined) = joined else { break };
            tally.record(outcome_of(joined, &config.name));

            if !stragglers_cancelled && state.lock().is_stopped() {
                let cancelled =
                    self.cancel_stragglers(state, config.sweep.straggler_policy, log, false);
                handles.mark_cancelled(&cancelled, grace);
                stragglers_cancelled = true;
            }
        }
        tally
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn outcome_of(joined: Result<WorkerOutcome, JoinError>, experiment: &str) -> WorkerOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            error!(experiment = %experiment, "worker panicked");
            WorkerOutcome::Failed
        }
        Err(_) => {
            debug!(experiment = %experiment, "worker task aborted");
            WorkerOutcome::Cancelled
        }
    }
}

enum Decision {
    Discard,
    Failed(EvaluationError),
    Measured { metric: f64, crossed: bool, first: bool },
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    point: ParameterPoint,
    cancel: CancelToken,
    mut slot: WorkerSlot,
) -> WorkerOutcome {
    let config = &ctx.config;
    ctx.log.worker(point, messages::STARTING);

    let output_dir = config.output_location(&point);
    let result = ctx
        .evaluator
        .evaluate(EvaluationRequest {
            experiment: config,
            point,
            output_dir: &output_dir,
            cancel: &cancel,
        })
        .await
        .and_then(|metric| {
            if metric.is_finite() {
                Ok(metric)
            } else {
                Err(EvaluationError::Other {
                    message: format!("non-finite metric {metric}"),
                })
            }
        });

    // Cancellation and completion are decided under the sweep lock, so a
    // worker cancelled as a straggler never publishes.
    let decision = {
        let mut s = ctx.state.lock();
        slot.registration.complete(&mut s);
        if cancel.is_cancelled() {
            Decision::Discard
        } else {
            match result {
                Err(e) => Decision::Failed(e),
                Ok(metric) => {
                    let crossed = metric >= config.sweep.threshold;
                    let first =
                        crossed && s.request_stop(StopReason::ThresholdReached { point, metric });
                    Decision::Measured {
                        metric,
                        crossed,
                        first,
                    }
                }
            }
        }
    };

    let outcome = match decision {
        Decision::Discard => {
            ctx.log.worker(point, messages::CANCELLED);
            debug!(experiment = %config.name, parameter = %point, "worker cancelled, result discarded");
            WorkerOutcome::Cancelled
        }
        Decision::Failed(e) => {
            ctx.log.worker(point, messages::failed(&e));
            warn!(experiment = %config.name, parameter = %point, error = %e, "evaluation failed");
            WorkerOutcome::Failed
        }
        Decision::Measured {
            metric,
            crossed,
            first,
        } => {
            ctx.sink.publish(Measurement::new(point.as_f64(), metric));
            ctx.log.worker(point, messages::done(metric));
            if crossed {
                ctx.log.worker(point, messages::LATENCY_LIMIT);
            }
            if first {
                ctx.gate.close();
                info!(
                    experiment = %config.name,
                    parameter = %point,
                    metric,
                    threshold = config.sweep.threshold,
                    "threshold reached"
                );
            }
            WorkerOutcome::Completed
        }
    };

    slot.permit.release();
    outcome
}
