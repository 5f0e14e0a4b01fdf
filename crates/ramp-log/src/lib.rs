//! Shared progress log and progress monitoring for Ramp.
//!
//! Provides:
//! - A process-wide, lock-protected, append-only progress log that every
//!   sweep and worker writes one line per event to
//! - A parser that re-derives per-experiment progress from that log, for the
//!   live `ramp watch` monitor

pub mod monitor;
pub mod progress;

pub use monitor::{ExperimentProgress, LogLine, ProgressSummary};
pub use progress::{messages, ExperimentLog, ProgressLog};
