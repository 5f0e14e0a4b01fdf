//! Progress summary derived from the progress log.
//!
//! The monitor re-reads the whole log on every refresh and re-derives its
//! counts, so [`ProgressSummary::from_log`] is a pure fold over the text. A
//! trailing line without a newline may still be mid-write and is ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::progress::messages;

/// One parsed progress-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLine<'a> {
    Experiment {
        name: &'a str,
        message: &'a str,
    },
    Worker {
        name: &'a str,
        parameter: &'a str,
        message: &'a str,
    },
}

impl<'a> LogLine<'a> {
    /// Parse a single line. Run-level lines yield `None`.
    pub fn parse(line: &'a str) -> Option<Self> {
        let rest = line.strip_prefix("Experiment: ")?;
        let (name, rest) = rest.split_once(" -> ")?;

        if let Some(worker) = rest.strip_prefix("worker ") {
            if let Some((parameter, message)) = worker.split_once(" -> ") {
                if is_parameter(parameter) {
                    return Some(Self::Worker {
                        name,
                        parameter,
                        message,
                    });
                }
            }
        }

        Some(Self::Experiment {
            name,
            message: rest,
        })
    }
}

fn is_parameter(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Progress of one experiment as seen in the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentProgress {
    pub exited: bool,
    pub started: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub peak_latency: f64,
}

/// Per-experiment progress for a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSummary {
    pub experiments: BTreeMap<String, ExperimentProgress>,
}

impl ProgressSummary {
    /// Fold every complete line of `text`.
    pub fn from_log(text: &str) -> Self {
        let complete = match text.rfind('\n') {
            Some(end) => &text[..end],
            None => "",
        };

        let mut summary = Self::default();
        for line in complete.lines() {
            if let Some(parsed) = LogLine::parse(line) {
                summary.apply(parsed);
            }
        }
        summary
    }

    /// Read and fold the log file at `path`.
    pub fn read(path: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_log(&String::from_utf8_lossy(&bytes)))
    }

    fn apply(&mut self, line: LogLine<'_>) {
        match line {
            LogLine::Experiment { name, message } => {
                let progress = self.experiments.entry(name.to_string()).or_default();
                if message == messages::EXITED {
                    progress.exited = true;
                }
            }
            LogLine::Worker {
                name,
                parameter,
                message,
            } => {
                let progress = self.experiments.entry(name.to_string()).or_default();
                if message.starts_with(messages::STARTING) {
                    progress.started.insert(parameter.to_string());
                } else if let Some(latency) = message.strip_prefix("done, with latency ") {
                    progress.completed.insert(parameter.to_string());
                    if let Ok(latency) = latency.trim().parse::<f64>() {
                        progress.peak_latency = progress.peak_latency.max(latency);
                    }
                } else if message.starts_with("failed") {
                    progress.failed.insert(parameter.to_string());
                }
            }
        }
    }

    pub fn experiments_total(&self) -> usize {
        self.experiments.len()
    }

    pub fn experiments_exited(&self) -> usize {
        self.experiments.values().filter(|p| p.exited).count()
    }

    pub fn workers_started(&self) -> usize {
        self.experiments.values().map(|p| p.started.len()).sum()
    }

    pub fn workers_completed(&self) -> usize {
        self.experiments.values().map(|p| p.completed.len()).sum()
    }

    /// Text table for the live monitor.
    pub fn render(&self, elapsed: Duration) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Elapsed Time: {:>10.1}", elapsed.as_secs_f64());
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Experiments {:>55}",
            format!("{} / {}", self.experiments_exited(), self.experiments_total())
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Workers {:>57}",
            format!(
                "{:>3}  / {:>3}",
                self.workers_completed(),
                self.workers_started()
            )
        );

        for (name, progress) in &self.experiments {
            let mark = if progress.exited { "X" } else { " " };
            let label = format!("[ {mark} ] {name}");
            let _ = writeln!(
                out,
                "    {label:<50} {:>3}  / {:>3}    Peak: {:>5.2}",
                progress.completed.len(),
                progress.started.len(),
                progress.peak_latency
            );
        }
        out
    }
}
