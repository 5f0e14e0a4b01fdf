//! Measurements and the reports a run produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

use crate::errors::RampResult;
use crate::experiment::ExperimentConfig;

/// A single measured metric at one parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "injection_rate")]
    pub parameter: f64,
    #[serde(rename = "packet_latency")]
    pub metric: f64,
}

impl Measurement {
    pub fn new(parameter: f64, metric: f64) -> Self {
        Self { parameter, metric }
    }
}

/// How a sweep ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SweepStatus {
    /// A worker's metric reached the threshold at `parameter`.
    ThresholdReached { parameter: f64 },
    /// The point cap was hit without crossing the threshold.
    Exhausted,
    /// The run was shut down before the sweep finished.
    Aborted,
    /// The sweep could not run to completion.
    Failed { error: String },
}

/// Counters describing one sweep's workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub elapsed_seconds: f64,
    /// Parameter of the worker whose metric stopped the sweep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<f64>,
}

impl SweepStats {
    /// Every dispatched worker ended in exactly one terminal state.
    pub fn is_balanced(&self) -> bool {
        self.dispatched == self.completed + self.failed + self.cancelled
    }
}

/// Experiment identity as it appears in the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub name: String,
    #[serde(flatten)]
    pub descriptor: Map<String, Value>,
}

impl From<&ExperimentConfig> for ExperimentSummary {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            name: config.name.clone(),
            descriptor: config.descriptor.clone(),
        }
    }
}

/// Final, immutable result of one experiment's sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment: ExperimentSummary,
    pub status: SweepStatus,
    /// Measurements in ascending parameter order.
    pub results: Vec<Measurement>,
    pub stats: SweepStats,
}

impl ExperimentReport {
    pub fn new(
        experiment: ExperimentSummary,
        status: SweepStatus,
        mut results: Vec<Measurement>,
        stats: SweepStats,
    ) -> Self {
        results.sort_by(|a, b| a.parameter.total_cmp(&b.parameter));
        Self {
            experiment,
            status,
            results,
            stats,
        }
    }

    /// Report for an experiment that produced nothing.
    pub fn empty(experiment: ExperimentSummary, status: SweepStatus) -> Self {
        Self::new(experiment, status, Vec::new(), SweepStats::default())
    }

    pub fn name(&self) -> &str {
        &self.experiment.name
    }

    /// Highest metric observed, if any.
    pub fn peak_metric(&self) -> Option<f64> {
        self.results.iter().map(|m| m.metric).reduce(f64::max)
    }
}

/// The whole run's output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub experiments: Vec<ExperimentReport>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, experiments: Vec<ExperimentReport>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            experiments,
        }
    }

    pub fn to_json_pretty(&self) -> RampResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report once, as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> RampResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
