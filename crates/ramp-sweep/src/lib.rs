//! # ramp-sweep
//!
//! Speculative, bounded-concurrency parameter sweeps.
//!
//! A [`SweepScheduler`] walks one experiment's parameter upward, keeping up to
//! `speculation_limit` evaluations in flight ahead of the frontier, stops when
//! a measured metric reaches the threshold and cancels whatever speculation
//! turned out to be unnecessary. An [`ExperimentPool`] runs many independent
//! sweeps under a separate outer concurrency limit.

mod cancel;
mod collector;
mod evaluator;
mod gate;
mod pool;
mod registry;
mod scheduler;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use collector::{MeasurementSink, ResultCollector};
pub use evaluator::{EvaluationRequest, Evaluator, FnEvaluator};
pub use gate::{SlotPermit, WorkerSlotGate};
pub use pool::{ExperimentPool, ExperimentState};
pub use registry::{
    Registration, SharedSweepState, StopReason, SweepState, WorkerHandle, WorkerRegistry,
};
pub use scheduler::{SchedulerOptions, SweepScheduler};
