//! Reads the metric out of an evaluator's report file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ramp_types::{EvalResult, EvaluationError};

/// Finds the first line of the report whose first token is `key` and parses
/// the token after it, e.g. `system.ruby.network.average_flit_latency 42.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricExtractor {
    report_file: PathBuf,
    key: String,
}

impl MetricExtractor {
    pub fn new(report_file: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            report_file: report_file.into(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Report location inside one evaluation's output directory.
    pub fn report_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.report_file)
    }

    pub fn parse(&self, report: &str) -> Option<f64> {
        report.lines().find_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next()? != self.key {
                return None;
            }
            tokens.next()?.parse().ok()
        })
    }

    pub async fn extract(&self, output_dir: &Path) -> EvalResult<f64> {
        let path = self.report_path(output_dir);
        let report = match tokio::fs::read_to_string(&path).await {
            Ok(report) => report,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EvaluationError::ReportMissing {
                    path: path.display().to_string(),
                })
            }
            Err(e) => {
                return Err(EvaluationError::Other {
                    message: format!("reading {}: {e}", path.display()),
                })
            }
        };
        self.parse(&report)
            .ok_or_else(|| EvaluationError::MetricUnavailable {
                key: self.key.clone(),
                path: path.display().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "system.ruby.network.average_flit_latency";

    #[test]
    fn parses_token_after_key() {
        let extractor = MetricExtractor::new("stats.txt", KEY);
        let report = "\
---------- Begin Simulation Statistics ----------
system.ruby.network.average_flit_network_latency    11.2   # cycles
system.ruby.network.average_flit_latency    42.517   # cycles
";
        assert_eq!(extractor.parse(report), Some(42.517));
        assert_eq!(extractor.parse("system.ruby.network.average_flit_latency nan-ish"), None);
        assert_eq!(extractor.parse(""), None);
    }

    #[tokio::test]
    async fn extract_distinguishes_missing_and_unparseable() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = MetricExtractor::new("stats.txt", KEY);

        let err = extractor.extract(dir.path()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::ReportMissing { .. }));

        std::fs::write(dir.path().join("stats.txt"), "sim_seconds 0.001\n").unwrap();
        let err = extractor.extract(dir.path()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::MetricUnavailable { .. }));

        std::fs::write(dir.path().join("stats.txt"), format!("{KEY} 17.25\n")).unwrap();
        assert_eq!(extractor.extract(dir.path()).await.unwrap(), 17.25);
    }
}
