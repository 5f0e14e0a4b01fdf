//! Experiment and sweep configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::errors::SweepError;
use crate::parameter::{ParameterGrid, ParameterPoint};

/// What to do with in-flight stragglers once a sweep has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StragglerPolicy {
    /// Cancel every worker still registered when the loop exits.
    CancelAll,
    /// Cancel only workers dispatched after the one that crossed the
    /// threshold; earlier workers run to completion.
    CancelAbove,
}

impl Default for StragglerPolicy {
    fn default() -> Self {
        Self::CancelAll
    }
}

/// Sweep parameters for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// First dispatched value. Defaults to `delta`.
    pub start: Option<f64>,

    /// Step between consecutive dispatched values (> 0).
    pub delta: f64,

    /// Metric value at or above which the sweep stops.
    pub threshold: f64,

    /// Maximum number of concurrently in-flight evaluations (>= 1).
    pub speculation_limit: usize,

    /// Optional cap on the number of dispatched points.
    pub max_points: Option<u64>,

    pub straggler_policy: StragglerPolicy,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            start: None,
            delta: 0.02,
            threshold: 200.0,
            speculation_limit: 5,
            max_points: None,
            straggler_policy: StragglerPolicy::CancelAll,
        }
    }
}

impl SweepSettings {
    pub fn new(delta: f64, threshold: f64, speculation_limit: usize) -> Self {
        Self {
            delta,
            threshold,
            speculation_limit,
            ..Default::default()
        }
    }

    pub fn with_start(mut self, start: f64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_max_points(mut self, n: u64) -> Self {
        self.max_points = Some(n);
        self
    }

    pub fn with_straggler_policy(mut self, policy: StragglerPolicy) -> Self {
        self.straggler_policy = policy;
        self
    }

    pub fn first_value(&self) -> f64 {
        self.start.unwrap_or(self.delta)
    }

    /// Build the decimal grid this sweep dispatches along.
    pub fn grid(&self) -> Result<ParameterGrid, SweepError> {
        ParameterGrid::new(self.first_value(), self.delta)
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if !self.delta.is_finite() || self.delta <= 0.0 {
            return Err(invalid(format!(
                "step delta must be positive and finite, got {}",
                self.delta
            )));
        }
        if let Some(start) = self.start.filter(|s| !s.is_finite()) {
            return Err(invalid(format!("start must be finite, got {start}")));
        }
        if !self.threshold.is_finite() {
            return Err(invalid(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        if self.speculation_limit == 0 {
            return Err(invalid("speculation limit must be at least 1".to_string()));
        }
        if self.max_points == Some(0) {
            return Err(invalid("max_points must be at least 1 when set".to_string()));
        }
        self.grid().map(|_| ())
    }
}

/// Immutable description of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment identity; also the experiment's output path segment.
    pub name: String,

    /// Opaque experiment parameters passed through to the evaluator and
    /// echoed into the report.
    #[serde(default)]
    pub descriptor: Map<String, Value>,

    #[serde(default)]
    pub sweep: SweepSettings,

    /// Root under which this experiment's per-point outputs are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn invalid(message: String) -> SweepError {
    SweepError::InvalidConfig { message }
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, sweep: SweepSettings) -> Self {
        Self {
            name: name.into(),
            descriptor: Map::new(),
            sweep,
            output_dir: default_output_dir(),
        }
    }

    pub fn with_descriptor(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.descriptor.insert(key.into(), value.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Look up a descriptor field.
    pub fn descriptor_field(&self, key: &str) -> Option<&Value> {
        self.descriptor.get(key)
    }

    /// Unique output location for one `(experiment, parameter)` pair.
    pub fn output_location(&self, point: &ParameterPoint) -> PathBuf {
        self.output_dir
            .join(&self.name)
            .join(format!("inj-{point}"))
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if self.name.trim().is_empty() {
            return Err(invalid("experiment name must not be empty".to_string()));
        }
        if self.name.contains('/') || self.name.contains('\\') || self.name == ".." {
            return Err(invalid(format!(
                "experiment name '{}' must be a single path segment",
                self.name
            )));
        }
        self.sweep.validate().map_err(|e| match e {
            SweepError::InvalidConfig { message } => invalid(format!("{}: {message}", self.name)),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ExperimentConfig {
        ExperimentConfig::new("cores-64_benchmark-SHUFFLE_vc-4", SweepSettings::default())
            .with_descriptor("cores", 64)
            .with_descriptor("benchmark", "SHUFFLE")
            .with_output_dir("/tmp/ramp")
    }

    #[test]
    fn default_sweep_starts_at_delta() {
        let settings = SweepSettings::default();
        assert_eq!(settings.first_value(), 0.02);
        assert_eq!(settings.grid().unwrap().point(0).to_string(), "0.02");
        assert_eq!(settings.with_start(0.1).first_value(), 0.1);
    }

    #[test]
    fn output_locations_are_unique_per_point() {
        let config = sample_config();
        let grid = config.sweep.grid().unwrap();

        let a = config.output_location(&grid.point(0));
        let b = config.output_location(&grid.point(1));
        assert_ne!(a, b);
        assert_eq!(
            a,
            PathBuf::from("/tmp/ramp/cores-64_benchmark-SHUFFLE_vc-4/inj-0.02")
        );
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = sample_config();
        config.sweep.delta = 0.0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.sweep.speculation_limit = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.sweep.threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.sweep.max_points = Some(0);
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.name = "a/b".into();
        assert!(config.validate().is_err());

        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{
            "name": "exp",
            "descriptor": {"vc": 4},
            "sweep": {"delta": 0.05, "threshold": 150.0, "straggler_policy": "cancel_above"}
        }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sweep.delta, 0.05);
        assert_eq!(config.sweep.speculation_limit, 5);
        assert_eq!(config.sweep.straggler_policy, StragglerPolicy::CancelAbove);
        assert_eq!(config.output_dir, PathBuf::from("results"));
        assert_eq!(config.descriptor_field("vc"), Some(&Value::from(4)));
    }
}
