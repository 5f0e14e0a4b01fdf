//! The evaluator seam: whatever turns one parameter value into a metric.

use async_trait::async_trait;
use std::path::Path;

use ramp_types::{EvalResult, EvaluationError, ExperimentConfig, ParameterPoint};

use crate::cancel::CancelToken;

/// Everything an evaluator is told about one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub experiment: &'a ExperimentConfig,
    pub point: ParameterPoint,

    /// Unique output location for this `(experiment, parameter)` pair. The
    /// evaluator writes its artifacts here.
    pub output_dir: &'a Path,

    /// Set when this evaluation is no longer needed.
    pub cancel: &'a CancelToken,
}

impl EvaluationRequest<'_> {
    /// Parameter value as a float.
    pub fn parameter(&self) -> f64 {
        self.point.as_f64()
    }
}

/// Produces a metric for one parameter value of one experiment.
///
/// Implementations may run for minutes. They should watch
/// [`EvaluationRequest::cancel`] and return [`EvaluationError::Cancelled`]
/// promptly once it fires, cleaning up anything they spawned.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluationRequest<'_>) -> EvalResult<f64>;

    /// Human-readable evaluator name.
    fn name(&self) -> &str;
}

/// Adapts a synchronous closure into an [`Evaluator`]. Intended for cheap,
/// non-blocking metric functions (synthetic models, tests).
pub struct FnEvaluator<F> {
    name: String,
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&ExperimentConfig, f64) -> EvalResult<f64> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&ExperimentConfig, f64) -> EvalResult<f64> + Send + Sync,
{
    async fn evaluate(&self, request: EvaluationRequest<'_>) -> EvalResult<f64> {
        if request.cancel.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }
        (self.f)(request.experiment, request.parameter())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
