use thiserror::Error;

/// Main error type for Ramp
#[derive(Error, Debug)]
pub enum RampError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Sweep-level errors.
///
/// Only configuration problems and an outer shutdown request ever fail a
/// sweep; evaluator failures stay local to the worker that hit them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("Invalid sweep configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Sweep shut down before completion: {experiment}")]
    Shutdown { experiment: String },
}

/// Errors produced by a single evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Evaluator could not be started: {message}")]
    SpawnFailed { message: String },

    #[error("Evaluator exited unsuccessfully: {status}")]
    ExitFailure { status: String },

    #[error("Report not found: {path}")]
    ReportMissing { path: String },

    #[error("No parseable metric '{key}' in {path}")]
    MetricUnavailable { key: String, path: String },

    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Process cleanup failed for group {pgid}: {message}")]
    CleanupFailed { pgid: i32, message: String },

    #[error("Evaluation failed: {message}")]
    Other { message: String },
}

impl EvaluationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for Ramp operations
pub type RampResult<T> = Result<T, RampError>;

/// Result type alias for a single evaluation
pub type EvalResult<T> = Result<T, EvaluationError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::errors::RampError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::RampError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EvaluationError::MetricUnavailable {
            key: "average_flit_latency".to_string(),
            path: "results/inj-0.10/stats.txt".to_string(),
        };

        assert!(error.to_string().contains("average_flit_latency"));
        assert!(error.to_string().contains("inj-0.10"));
    }

    #[test]
    fn test_error_conversion() {
        let sweep_error = SweepError::Shutdown {
            experiment: "cores-64".to_string(),
        };
        let ramp_error: RampError = sweep_error.into();

        match ramp_error {
            RampError::Sweep(SweepError::Shutdown { .. }) => (),
            _ => panic!("Expected Sweep error"),
        }
    }

    #[test]
    fn test_cancelled_classification() {
        assert!(EvaluationError::Cancelled.is_cancelled());
        assert!(!EvaluationError::Other {
            message: "boom".into()
        }
        .is_cancelled());
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, RampError::Validation(_)));
        let config_err = config_error!("Missing required field: {}", "delta");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Missing required field: delta"
        );
    }
}
