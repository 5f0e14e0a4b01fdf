//! In-flight worker registry and the per-sweep state it lives in.
//!
//! The registry, the dispatch index and the stop flag are guarded by one
//! mutex per sweep. The dispatch loop re-checks the stop flag under that lock
//! before registering, and the straggler pass enumerates under it, so a worker
//! can never be registered after the cancellation pass has looked.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ramp_types::{ParameterGrid, ParameterPoint};

use crate::cancel::CancelToken;

/// One in-flight evaluation.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    point: ParameterPoint,
    cancel: CancelToken,
    dispatched_at: Instant,
}

impl WorkerHandle {
    pub fn new(point: ParameterPoint, cancel: CancelToken) -> Self {
        Self {
            point,
            cancel,
            dispatched_at: Instant::now(),
        }
    }

    pub fn point(&self) -> ParameterPoint {
        self.point
    }

    pub fn index(&self) -> u64 {
        self.point.index
    }

    /// Request cancellation of this worker.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn running_for(&self) -> Duration {
        self.dispatched_at.elapsed()
    }
}

/// Pending workers keyed by dispatch index.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<u64, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending worker. Returns `false` if its index is already
    /// registered.
    pub fn register(&mut self, handle: WorkerHandle) -> bool {
        if self.workers.contains_key(&handle.index()) {
            return false;
        }
        self.workers.insert(handle.index(), handle);
        true
    }

    pub fn deregister(&mut self, index: u64) -> Option<WorkerHandle> {
        self.workers.remove(&index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.workers.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All pending workers in dispatch order.
    pub fn snapshot(&self) -> Vec<WorkerHandle> {
        self.workers.values().cloned().collect()
    }

    /// Pending workers dispatched after `above`, or all of them.
    pub fn stragglers(&self, above: Option<u64>) -> Vec<WorkerHandle> {
        match above {
            Some(index) => self
                .workers
                .range(index.saturating_add(1)..)
                .map(|(_, handle)| handle.clone())
                .collect(),
            None => self.snapshot(),
        }
    }
}

/// Why a sweep stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// The first worker to complete with `metric >= threshold`.
    ThresholdReached { point: ParameterPoint, metric: f64 },
    /// The outer run was shut down.
    Shutdown,
}

/// Mutable state of one sweep.
#[derive(Debug, Default)]
pub struct SweepState {
    next_index: u64,
    stop: Option<StopReason>,
    registry: WorkerRegistry,
}

pub type SharedSweepState = Arc<Mutex<SweepState>>;

impl SweepState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// Set the stop flag. The first caller wins; later calls return `false`
    /// and leave the recorded reason unchanged.
    pub fn request_stop(&mut self, reason: StopReason) -> bool {
        if self.stop.is_some() {
            return false;
        }
        self.stop = Some(reason);
        true
    }

    /// Claim the next frontier point. Indices are never reused.
    pub fn next_point(&mut self, grid: &ParameterGrid) -> ParameterPoint {
        let point = grid.point(self.next_index);
        self.next_index += 1;
        point
    }

    /// Number of points dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.next_index
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WorkerRegistry {
        &mut self.registry
    }
}

/// Keeps one worker registered until it completes or is dropped.
///
/// Dropping an armed registration deregisters the worker, so failed,
/// cancelled, panicking and aborted workers all leave the registry.
#[derive(Debug)]
pub struct Registration {
    state: SharedSweepState,
    index: u64,
    armed: bool,
}

impl Registration {
    pub fn new(state: SharedSweepState, index: u64) -> Self {
        Self {
            state,
            index,
            armed: true,
        }
    }

    /// Deregister while the caller already holds the sweep lock.
    pub fn complete(&mut self, state: &mut SweepState) {
        state.registry_mut().deregister(self.index);
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().registry_mut().deregister(self.index);
        }
    }
}
