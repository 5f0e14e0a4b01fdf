//! # ramp-eval
//!
//! Runs an external command once per sweep point and reads the metric back
//! from a report file it writes. Each command runs in its own process group
//! so a cancelled evaluation takes its whole process tree down with it.
//!
//! Unix only.

mod command;
mod evaluator;
mod metric;
mod process;

pub use command::CommandTemplate;
pub use evaluator::{EvaluatorConfig, ProcessEvaluator};
pub use metric::MetricExtractor;
pub use process::ProcessGroup;
