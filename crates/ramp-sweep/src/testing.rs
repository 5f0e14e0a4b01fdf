//! Scripted evaluator for scheduler and pool tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ramp_types::{EvalResult, EvaluationError};

use crate::evaluator::{EvaluationRequest, Evaluator};

type MetricFn = Box<dyn Fn(f64) -> f64 + Send + Sync>;
type DelayFn = Box<dyn Fn(f64) -> Option<Duration> + Send + Sync>;

/// Evaluator whose metric, latency and failures are scripted per parameter.
///
/// A `None` delay blocks until cancelled (or forever when cancellation is
/// ignored).
pub(crate) struct ScriptedEvaluator {
    metric: MetricFn,
    delay: DelayFn,
    failing: HashSet<String>,
    honour_cancel: bool,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedEvaluator {
    /// `metric = 1000 · parameter`, answering after a fixed delay.
    pub fn linear(delay: Duration) -> Self {
        Self::new(|p| 1000.0 * p, move |_| Some(delay))
    }

    pub fn new(
        metric: impl Fn(f64) -> f64 + Send + Sync + 'static,
        delay: impl Fn(f64) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        Self {
            metric: Box::new(metric),
            delay: Box::new(delay),
            failing: HashSet::new(),
            honour_cancel: true,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Fail every evaluation of `parameter` (as rendered, e.g. `"0.10"`).
    pub fn failing_at(mut self, parameter: &str) -> Self {
        self.failing.insert(parameter.to_string());
        self
    }

    /// Keep running after cancellation, like an evaluator that never checks.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Parameters in the order their evaluations started.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// Parameters whose evaluation observed cancellation.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: EvaluationRequest<'_>) -> EvalResult<f64> {
        let parameter = request.point.to_string();
        self.seen.lock().push(parameter.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        let wait = async {
            match (self.delay)(request.parameter()) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        if self.honour_cancel {
            tokio::select! {
                _ = wait => {}
                _ = request.cancel.cancelled() => {
                    self.cancelled.lock().push(parameter);
                    return Err(EvaluationError::Cancelled);
                }
            }
        } else {
            wait.await;
        }

        if self.failing.contains(&parameter) {
            return Err(EvaluationError::ReportMissing {
                path: request.output_dir.join("stats.txt").display().to_string(),
            });
        }
        Ok((self.metric)(request.parameter()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
