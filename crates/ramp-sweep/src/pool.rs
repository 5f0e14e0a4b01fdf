//! Runs many independent sweeps under an outer concurrency limit.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use ramp_types::{ExperimentConfig, ExperimentReport, ExperimentSummary, SweepError, SweepStatus};

use crate::cancel::CancelToken;
use crate::gate::WorkerSlotGate;
use crate::scheduler::SweepScheduler;

/// Lifecycle of one experiment within a pool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

/// Runs one [`SweepScheduler`] per experiment, at most `max_concurrent` at a
/// time. Sweeps share nothing but the progress log; a failure or panic in one
/// becomes that experiment's report and never reaches its siblings.
pub struct ExperimentPool {
    scheduler: Arc<SweepScheduler>,
    max_concurrent: usize,
    shutdown: CancelToken,
    board: Arc<DashMap<String, ExperimentState>>,
}

impl ExperimentPool {
    pub fn new(scheduler: SweepScheduler, max_concurrent: usize) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            max_concurrent,
            shutdown: CancelToken::new(),
            board: Arc::new(DashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Token that aborts the run when cancelled.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Stop dispatching and cancel every in-flight worker of every sweep.
    pub fn shutdown(&self) {
        warn!("experiment pool shutting down");
        self.shutdown.cancel();
    }

    pub fn state(&self, name: &str) -> Option<ExperimentState> {
        self.board.get(name).map(|entry| *entry.value())
    }

    /// Every experiment's current state, sorted by name.
    pub fn states(&self) -> Vec<(String, ExperimentState)> {
        let mut states: Vec<_> = self
            .board
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Check every configuration before any sweep starts.
    pub fn validate(&self, configs: &[ExperimentConfig]) -> Result<(), SweepError> {
        if self.max_concurrent == 0 {
            return Err(SweepError::InvalidConfig {
                message: "experiment concurrency must be at least 1".to_string(),
            });
        }
        let mut names = HashSet::new();
        for config in configs {
            config.validate()?;
            if !names.insert(config.name.as_str()) {
                return Err(SweepError::InvalidConfig {
                    message: format!("duplicate experiment name '{}'", config.name),
                });
            }
        }
        Ok(())
    }

    /// Sweep every experiment and return their reports in input order.
    ///
    /// Dropping the returned future aborts every sweep it started.
    pub async fn run_all(
        &self,
        configs: Vec<ExperimentConfig>,
    ) -> Result<Vec<ExperimentReport>, SweepError> {
        self.validate(&configs)?;

        self.board.clear();
        for config in &configs {
            self.board.insert(config.name.clone(), ExperimentState::Pending);
        }

        let progress = self.scheduler.progress();
        progress.note("Starting experiments.");
        info!(
            experiments = configs.len(),
            max_concurrent = self.max_concurrent,
            "starting experiments"
        );

        let gate = WorkerSlotGate::new(self.max_concurrent);
        let summaries: Vec<ExperimentSummary> =
            configs.iter().map(ExperimentSummary::from).collect();
        let mut running = JoinSet::new();
        for (slot, config) in configs.into_iter().enumerate() {
            let experiment = run_experiment(
                Arc::clone(&self.scheduler),
                gate.clone(),
                self.shutdown.clone(),
                Arc::clone(&self.board),
                config,
            );
            running.spawn(async move { (slot, experiment.await) });
        }

        let mut finished: Vec<Option<ExperimentReport>> = vec![None; summaries.len()];
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((slot, report)) => finished[slot] = Some(report),
                Err(e) => error!(error = %e, "experiment task failed"),
            }
        }

        let reports: Vec<ExperimentReport> = summaries
            .into_iter()
            .zip(finished)
            .map(|(summary, report)| {
                report.unwrap_or_else(|| {
                    self.board.insert(summary.name.clone(), ExperimentState::Failed);
                    ExperimentReport::empty(
                        summary,
                        SweepStatus::Failed {
                            error: "experiment task failed".to_string(),
                        },
                    )
                })
            })
            .collect();

        progress.note("Done all experiments.");
        info!(experiments = reports.len(), "all experiments finished");
        Ok(reports)
    }
}

async fn run_experiment(
    scheduler: Arc<SweepScheduler>,
    gate: WorkerSlotGate,
    shutdown: CancelToken,
    board: Arc<DashMap<String, ExperimentState>>,
    config: ExperimentConfig,
) -> ExperimentReport {
    let summary = ExperimentSummary::from(&config);
    let name = config.name.clone();

    let permit = tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        permit = gate.acquire() => permit,
    };
    let Some(_permit) = permit else {
        board.insert(name, ExperimentState::Aborted);
        return ExperimentReport::empty(summary, SweepStatus::Aborted);
    };

    board.insert(name.clone(), ExperimentState::Running);

    // The sweep runs in its own task so a panic surfaces as a JoinError here.
    let mut sweep = JoinSet::new();
    sweep.spawn(async move { scheduler.run(&config, &shutdown).await });
    let Some(joined) = sweep.join_next().await else {
        board.insert(name, ExperimentState::Failed);
        return ExperimentReport::empty(
            summary,
            SweepStatus::Failed {
                error: "sweep task vanished".to_string(),
            },
        );
    };

    let (state, report) = match joined {
        Ok(Ok(report)) => (ExperimentState::Completed, report),
        Ok(Err(SweepError::Shutdown { .. })) => (
            ExperimentState::Aborted,
            ExperimentReport::empty(summary, SweepStatus::Aborted),
        ),
        Ok(Err(e)) => {
            error!(experiment = %name, error = %e, "sweep failed");
            (
                ExperimentState::Failed,
                ExperimentReport::empty(
                    summary,
                    SweepStatus::Failed {
                        error: e.to_string(),
                    },
                ),
            )
        }
        Err(e) => {
            error!(experiment = %name, error = %e, "sweep panicked");
            (
                ExperimentState::Failed,
                ExperimentReport::empty(
                    summary,
                    SweepStatus::Failed {
                        error: format!("sweep panicked: {e}"),
                    },
                ),
            )
        }
    };

    board.insert(name, state);
    report
}
