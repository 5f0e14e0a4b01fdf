//! [`Evaluator`] backed by an external command.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use ramp_sweep::{EvaluationRequest, Evaluator};
use ramp_types::{
    config_error, validation_error, EvalResult, EvaluationError, ExperimentConfig, RampResult,
};

use crate::command::CommandTemplate;
use crate::metric::MetricExtractor;
use crate::process::ProcessGroup;

/// How to run the evaluator command and where to find its metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Program to run; may contain placeholders.
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Report file, relative to the evaluation's output directory.
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,

    /// Report key whose value is the metric.
    pub metric_key: String,

    /// Time between SIGTERM and SIGKILL when cancelling.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Extra environment for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_report_file() -> PathBuf {
    PathBuf::from("stats.txt")
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl EvaluatorConfig {
    pub fn new(program: impl Into<String>, metric_key: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            report_file: default_report_file(),
            metric_key: metric_key.into(),
            cancel_grace_ms: default_cancel_grace_ms(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_report_file(mut self, report_file: impl Into<PathBuf>) -> Self {
        self.report_file = report_file.into();
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Runs one command per sweep point, in its own process group, and reads the
/// metric from the report file it leaves in the output directory. Command
/// output goes to `stdout.txt` and `stderr.txt` next to the report.
#[derive(Debug)]
pub struct ProcessEvaluator {
    name: String,
    template: CommandTemplate,
    extractor: MetricExtractor,
    env: BTreeMap<String, String>,
    cancel_grace: Duration,
}

impl ProcessEvaluator {
    pub fn new(config: EvaluatorConfig) -> RampResult<Self> {
        if config.metric_key.trim().is_empty() {
            return Err(config_error!("evaluator metric_key must not be empty"));
        }
        if config.report_file.as_os_str().is_empty() || config.report_file.is_absolute() {
            return Err(config_error!(
                "evaluator report_file must be a relative path, got '{}'",
                config.report_file.display()
            ));
        }
        let template = CommandTemplate::parse(&config.program, &config.args)?;
        Ok(Self {
            name: config.program.clone(),
            template,
            extractor: MetricExtractor::new(config.report_file, config.metric_key),
            env: config.env,
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
        })
    }

    /// Check that every descriptor field the command refers to exists.
    pub fn check_experiment(&self, config: &ExperimentConfig) -> RampResult<()> {
        let missing = self.template.missing_fields(config);
        if missing.is_empty() {
            return Ok(());
        }
        Err(validation_error!(
            "experiment '{}' is missing descriptor fields: {}",
            config.name,
            missing.join(", ")
        ))
    }

    fn capture(request: &EvaluationRequest<'_>, file: &str) -> EvalResult<Stdio> {
        let path = request.output_dir.join(file);
        File::create(&path)
            .map(Stdio::from)
            .map_err(|e| EvaluationError::SpawnFailed {
                message: format!("creating {}: {e}", path.display()),
            })
    }
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    async fn evaluate(&self, request: EvaluationRequest<'_>) -> EvalResult<f64> {
        if request.cancel.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }

        tokio::fs::create_dir_all(request.output_dir)
            .await
            .map_err(|e| EvaluationError::SpawnFailed {
                message: format!("creating {}: {e}", request.output_dir.display()),
            })?;

        let (program, args) = self.template.render(&request)?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&self.env)
            .env("RAMP_EXPERIMENT", &request.experiment.name)
            .env("RAMP_PARAMETER", request.point.to_string())
            .env("RAMP_OUTPUT_DIR", request.output_dir)
            .stdin(Stdio::null())
            .stdout(Self::capture(&request, "stdout.txt")?)
            .stderr(Self::capture(&request, "stderr.txt")?);

        let mut group =
            ProcessGroup::spawn(command).map_err(|e| EvaluationError::SpawnFailed {
                message: format!("{program}: {e}"),
            })?;
        debug!(
            experiment = %request.experiment.name,
            parameter = %request.point,
            pgid = group.pgid(),
            "evaluator started"
        );

        let status = tokio::select! {
            status = group.wait() => status.map_err(|e| EvaluationError::Other {
                message: format!("waiting for {program}: {e}"),
            })?,
            _ = request.cancel.cancelled() => {
                if let Err(e) = group.terminate(self.cancel_grace).await {
                    warn!(
                        experiment = %request.experiment.name,
                        parameter = %request.point,
                        error = %e,
                        "evaluator cleanup failed"
                    );
                }
                return Err(EvaluationError::Cancelled);
            }
        };

        if let Err(e) = group.reap_group() {
            warn!(
                experiment = %request.experiment.name,
                parameter = %request.point,
                error = %e,
                "leftover evaluator processes could not be killed"
            );
        }

        if !status.success() {
            return Err(EvaluationError::ExitFailure {
                status: status.to_string(),
            });
        }
        self.extractor.extract(request.output_dir).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::process::tests::{alive, read_pid, wait_dead};
    use ramp_log::ProgressLog;
    use ramp_sweep::{CancelToken, SweepScheduler};
    use ramp_types::{SweepSettings, SweepStatus};
    use std::path::Path;
    use std::sync::Arc;

    const KEY: &str = "average_flit_latency";

    fn shell(script: &str) -> EvaluatorConfig {
        EvaluatorConfig::new("sh", KEY)
            .with_args(["-c", script])
            .with_cancel_grace(Duration::from_millis(200))
    }

    async fn evaluate(
        evaluator: &ProcessEvaluator,
        config: &ExperimentConfig,
        output: &Path,
        cancel: &CancelToken,
    ) -> EvalResult<f64> {
        let point = config.sweep.grid().unwrap().point(0);
        evaluator
            .evaluate(EvaluationRequest {
                experiment: config,
                point,
                output_dir: output,
                cancel,
            })
            .await
    }

    fn experiment() -> ExperimentConfig {
        ExperimentConfig::new("exp", SweepSettings::default()).with_descriptor("base", 12.5)
    }

    #[tokio::test]
    async fn reads_metric_from_report() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("inj-0.02");
        let evaluator = ProcessEvaluator::new(shell(
            "echo running {name} at $RAMP_PARAMETER; echo \"average_flit_latency {descriptor.base}\" > {output_dir}/stats.txt",
        ))
        .unwrap();

        let metric = evaluate(&evaluator, &experiment(), &output, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(metric, 12.5);

        let stdout = std::fs::read_to_string(output.join("stdout.txt")).unwrap();
        assert_eq!(stdout, "running exp at 0.02\n");
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let failing = ProcessEvaluator::new(shell("echo oops >&2; exit 3")).unwrap();
        let err = evaluate(&failing, &experiment(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::ExitFailure { .. }));
        let stderr = std::fs::read_to_string(dir.path().join("stderr.txt")).unwrap();
        assert_eq!(stderr, "oops\n");

        let silent = ProcessEvaluator::new(shell("true")).unwrap();
        let err = evaluate(&silent, &experiment(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::ReportMissing { .. }));

        let missing = ProcessEvaluator::new(
            EvaluatorConfig::new("/nonexistent/ramp-evaluator", KEY),
        )
        .unwrap();
        let err = evaluate(&missing, &experiment(), dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ProcessEvaluator::new(shell(
            "sleep 30 & echo $! > {output_dir}/child.pid; wait",
        ))
        .unwrap();
        let config = experiment();
        let cancel = CancelToken::new();

        let trigger = async {
            let pid = read_pid(&dir.path().join("child.pid")).await;
            assert!(alive(pid));
            cancel.cancel();
            pid
        };
        let (result, pid) = tokio::join!(evaluate(&evaluator, &config, dir.path(), &cancel), trigger);

        assert_eq!(result.unwrap_err(), EvaluationError::Cancelled);
        assert!(wait_dead(pid).await);
    }

    #[tokio::test]
    async fn dropped_evaluation_kills_the_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ProcessEvaluator::new(shell(
            "sleep 30 & echo $! > {output_dir}/child.pid; wait",
        ))
        .unwrap();
        let config = experiment();
        let cancel = CancelToken::new();

        let pid_file = dir.path().join("child.pid");
        let outcome = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(evaluate(&evaluator, &config, dir.path(), &cancel), async {
                read_pid(&pid_file).await
            })
        })
        .await;
        assert!(outcome.is_err(), "evaluation should still be running");

        let pid = read_pid(&pid_file).await;
        assert!(wait_dead(pid).await);
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        assert!(ProcessEvaluator::new(EvaluatorConfig::new("sh", "")).is_err());
        assert!(ProcessEvaluator::new(EvaluatorConfig::new("sh", KEY).with_report_file("/abs")).is_err());
        assert!(ProcessEvaluator::new(shell("{bogus}")).is_err());

        let evaluator = ProcessEvaluator::new(shell("echo {descriptor.vc}")).unwrap();
        assert!(matches!(
            evaluator.check_experiment(&experiment()),
            Err(ramp_types::RampError::Validation(_))
        ));
        assert!(evaluator
            .check_experiment(&experiment().with_descriptor("vc", 4))
            .is_ok());
    }

    #[tokio::test]
    async fn drives_a_full_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ProcessEvaluator::new(shell(
            "awk -v p={parameter} 'BEGIN {{ printf \"average_flit_latency %f\\n\", p * 1000 }}' > {output_dir}/stats.txt",
        ))
        .unwrap();
        let scheduler = SweepScheduler::new(Arc::new(evaluator), Arc::new(ProgressLog::in_memory()));
        let config = ExperimentConfig::new("awk", SweepSettings::new(0.02, 100.0, 1))
            .with_output_dir(dir.path());

        let report = scheduler.run(&config, &CancelToken::new()).await.unwrap();

        assert_eq!(report.status, SweepStatus::ThresholdReached { parameter: 0.1 });
        assert_eq!(report.results.len(), 5);
        assert!(report
            .results
            .iter()
            .all(|m| (m.metric - 1000.0 * m.parameter).abs() < 1e-6));
        assert!(dir.path().join("awk").join("inj-0.10").join("stats.txt").exists());
    }
}
