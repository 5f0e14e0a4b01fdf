//! Run plans: one JSON document describing a whole run.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ramp_eval::{EvaluatorConfig, ProcessEvaluator};
use ramp_types::{ExperimentConfig, StragglerPolicy, SweepSettings};

pub const ENV_OUTPUT_DIR: &str = "RAMP_OUTPUT_DIR";
pub const ENV_LOG_FILE: &str = "RAMP_LOG_FILE";
pub const ENV_MAX_EXPERIMENTS: &str = "RAMP_MAX_EXPERIMENTS";

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Root of every experiment's output tree.
    pub output_dir: PathBuf,

    /// Progress log. Defaults to `<output_dir>/log.log`.
    pub log_file: Option<PathBuf>,

    /// Final report. Defaults to `<output_dir>/output.json`.
    pub report_file: Option<PathBuf>,

    /// Experiments swept concurrently.
    pub max_experiments: usize,

    /// Grace given to cancelled workers before their tasks are aborted.
    pub cancel_grace_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            log_file: None,
            report_file: None,
            max_experiments: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cancel_grace_ms: 10_000,
        }
    }
}

impl RunSettings {
    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("log.log"))
    }

    pub fn report_file(&self) -> PathBuf {
        self.report_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("output.json"))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Per-experiment overrides of the plan's default sweep settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOverrides {
    pub start: Option<f64>,
    pub delta: Option<f64>,
    pub threshold: Option<f64>,
    pub speculation_limit: Option<usize>,
    pub max_points: Option<u64>,
    pub straggler_policy: Option<StragglerPolicy>,
}

impl SweepOverrides {
    pub fn apply(&self, base: &SweepSettings) -> SweepSettings {
        SweepSettings {
            start: self.start.or(base.start),
            delta: self.delta.unwrap_or(base.delta),
            threshold: self.threshold.unwrap_or(base.threshold),
            speculation_limit: self.speculation_limit.unwrap_or(base.speculation_limit),
            max_points: self.max_points.or(base.max_points),
            straggler_policy: self.straggler_policy.unwrap_or(base.straggler_policy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub name: String,
    #[serde(default)]
    pub descriptor: Map<String, Value>,
    #[serde(default)]
    pub sweep: SweepOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub defaults: SweepSettings,
    pub evaluator: EvaluatorConfig,
    pub experiments: Vec<ExperimentEntry>,
}

/// Command-line overrides; these win over both the plan and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
    pub max_experiments: Option<usize>,
}

impl RunPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing plan {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply `RAMP_*` overrides from `lookup` (normally the process
    /// environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.run.output_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(ENV_LOG_FILE) {
            self.run.log_file = Some(PathBuf::from(file));
        }
        if let Some(max) = lookup(ENV_MAX_EXPERIMENTS) {
            self.run.max_experiments = max
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_EXPERIMENTS}={max} is not a count"))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.output_dir {
            self.run.output_dir = dir.clone();
        }
        if let Some(file) = &overrides.log_file {
            self.run.log_file = Some(file.clone());
        }
        if let Some(file) = &overrides.report_file {
            self.run.report_file = Some(file.clone());
        }
        if let Some(max) = overrides.max_experiments {
            self.run.max_experiments = max;
        }
    }

    /// One configuration per experiment, in plan order.
    pub fn experiments(&self) -> Vec<ExperimentConfig> {
        self.experiments
            .iter()
            .map(|entry| ExperimentConfig {
                name: entry.name.clone(),
                descriptor: entry.descriptor.clone(),
                sweep: entry.sweep.apply(&self.defaults),
                output_dir: self.run.output_dir.clone(),
            })
            .collect()
    }

    /// Check the whole plan and build its evaluator.
    pub fn validate(&self) -> Result<ProcessEvaluator> {
        if self.run.max_experiments == 0 {
            bail!("run.max_experiments must be at least 1");
        }
        if self.experiments.is_empty() {
            bail!("plan has no experiments");
        }

        let evaluator =
            ProcessEvaluator::new(self.evaluator.clone()).context("invalid evaluator")?;

        let mut names = HashSet::new();
        for config in self.experiments() {
            config.validate()?;
            evaluator.check_experiment(&config)?;
            if !names.insert(config.name.clone()) {
                bail!("duplicate experiment name '{}'", config.name);
            }
        }
        Ok(evaluator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SYNTHETIC: &str = include_str!("../plans/synthetic.json");

    fn minimal() -> RunPlan {
        RunPlan::parse(
            r#"{
                "evaluator": { "program": "sim", "args": ["--rate={parameter}"], "metric_key": "latency" },
                "experiments": [ { "name": "a" }, { "name": "b", "sweep": { "threshold": 50.0 } } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn bundled_plan_is_valid() {
        let plan = RunPlan::parse(SYNTHETIC).unwrap();
        plan.validate().unwrap();

        let configs = plan.experiments();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].sweep.speculation_limit, 5);
        assert_eq!(configs[0].sweep.max_points, Some(60));
        assert_eq!(configs[2].sweep.speculation_limit, 3);
        assert_eq!(configs[2].sweep.straggler_policy, StragglerPolicy::CancelAbove);
        assert_eq!(configs[2].sweep.threshold, 200.0);
    }

    #[test]
    fn defaults_and_overrides_merge() {
        let plan = minimal();
        assert_eq!(plan.run.output_dir, PathBuf::from("results"));
        assert_eq!(plan.run.log_file(), PathBuf::from("results/log.log"));
        assert_eq!(plan.run.report_file(), PathBuf::from("results/output.json"));

        let configs = plan.experiments();
        assert_eq!(configs[0].sweep, SweepSettings::default());
        assert_eq!(configs[1].sweep.threshold, 50.0);
        assert_eq!(configs[1].sweep.delta, 0.02);
        assert_eq!(configs[1].output_dir, PathBuf::from("results"));
    }

    #[test]
    fn environment_then_flags() {
        let env: HashMap<&str, &str> = [
            (ENV_OUTPUT_DIR, "/data/run"),
            (ENV_MAX_EXPERIMENTS, "7"),
        ]
        .into_iter()
        .collect();

        let mut plan = minimal();
        plan.apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(plan.run.output_dir, PathBuf::from("/data/run"));
        assert_eq!(plan.run.max_experiments, 7);
        assert_eq!(plan.run.log_file(), PathBuf::from("/data/run/log.log"));

        plan.apply_overrides(&Overrides {
            max_experiments: Some(2),
            log_file: Some(PathBuf::from("progress.log")),
            ..Default::default()
        });
        assert_eq!(plan.run.max_experiments, 2);
        assert_eq!(plan.run.log_file(), PathBuf::from("progress.log"));
        assert_eq!(plan.experiments()[0].output_dir, PathBuf::from("/data/run"));

        let mut plan = minimal();
        assert!(plan
            .apply_env(|key| (key == ENV_MAX_EXPERIMENTS).then(|| "many".to_string()))
            .is_err());
    }

    #[test]
    fn validation_catches_plan_errors() {
        let mut plan = minimal();
        plan.experiments[1].name = "a".into();
        assert!(plan.validate().is_err());

        let mut plan = minimal();
        plan.evaluator.args.push("{descriptor.cores}".into());
        let err = plan.validate().unwrap_err();
        assert!(format!("{err:#}").contains("cores"));

        let mut plan = minimal();
        plan.experiments[0].sweep.speculation_limit = Some(0);
        assert!(plan.validate().is_err());

        let mut plan = minimal();
        plan.run.max_experiments = 0;
        assert!(plan.validate().is_err());

        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = RunPlan::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("plan.json"));
    }
}
