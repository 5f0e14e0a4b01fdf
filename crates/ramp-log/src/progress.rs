//! Append-only progress log shared by every sweep and worker.
//!
//! Each event is written as one complete line with a single `write_all`
//! under the log's mutex, so a reader tailing the file only ever sees whole
//! lines plus, at worst, one partial trailing line.

use parking_lot::Mutex;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Distinguished messages the monitor keys on.
pub mod messages {
    /// Experiment-level: the dispatch loop has exited.
    pub const EXITED: &str = "exited";
    /// Worker-level: evaluation started.
    pub const STARTING: &str = "starting";
    /// Worker-level: this worker's metric crossed the threshold.
    pub const LATENCY_LIMIT: &str = "reached latency limit";
    /// Worker-level: the worker was cancelled and its result discarded.
    pub const CANCELLED: &str = "cancelled";

    /// Worker-level: evaluation finished with `metric`.
    pub fn done(metric: f64) -> String {
        format!("done, with latency {metric:.6}")
    }

    /// Worker-level: evaluation failed.
    pub fn failed(reason: impl std::fmt::Display) -> String {
        format!("failed: {reason}")
    }
}

const EXPERIMENT_PREFIX: &str = "Experiment: ";
const SEPARATOR: &str = " -> ";

#[derive(Debug)]
enum Sink {
    File { file: File, path: PathBuf },
    Memory(Vec<u8>),
    Discard,
}

/// Process-wide progress log.
#[derive(Debug)]
pub struct ProgressLog {
    sink: Mutex<Sink>,
}

impl ProgressLog {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self::from_sink(Sink::File {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Open `path` for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_sink(Sink::File {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Keep lines in memory; read them back with [`ProgressLog::contents`].
    pub fn in_memory() -> Self {
        Self::from_sink(Sink::Memory(Vec::new()))
    }

    /// Drop every line.
    pub fn discard() -> Self {
        Self::from_sink(Sink::Discard)
    }

    fn from_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// File backing this log, if any.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.sink.lock() {
            Sink::File { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Everything written so far, for in-memory logs.
    pub fn contents(&self) -> Option<String> {
        match &*self.sink.lock() {
            Sink::Memory(buf) => Some(String::from_utf8_lossy(buf).into_owned()),
            _ => None,
        }
    }

    /// Append a free-form run-level line.
    pub fn note(&self, message: impl Display) {
        self.write_line(&message.to_string());
    }

    /// Scoped writer for one experiment.
    pub fn experiment(self: &Arc<Self>, name: impl Into<String>) -> ExperimentLog {
        ExperimentLog {
            log: Arc::clone(self),
            name: name.into(),
        }
    }

    fn write_line(&self, text: &str) {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let mut sink = self.sink.lock();
        let result = match &mut *sink {
            Sink::File { file, .. } => file.write_all(line.as_bytes()),
            Sink::Memory(buf) => {
                buf.extend_from_slice(line.as_bytes());
                Ok(())
            }
            Sink::Discard => Ok(()),
        };
        drop(sink);

        if let Err(e) = result {
            warn!(error = %e, "failed to append to progress log");
        }
    }
}

/// Progress log writer bound to one experiment name.
#[derive(Debug, Clone)]
pub struct ExperimentLog {
    log: Arc<ProgressLog>,
    name: String,
}

impl ExperimentLog {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Experiment: <name> -> <message>`
    pub fn log(&self, message: impl Display) {
        self.log.write_line(&format!(
            "{EXPERIMENT_PREFIX}{}{SEPARATOR}{message}",
            self.name
        ));
    }

    /// `Experiment: <name> -> worker <parameter> -> <message>`
    pub fn worker(&self, parameter: impl Display, message: impl Display) {
        self.log.write_line(&format!(
            "{EXPERIMENT_PREFIX}{}{SEPARATOR}worker {parameter}{SEPARATOR}{message}",
            self.name
        ));
    }
}
