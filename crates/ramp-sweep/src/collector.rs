//! Concurrent measurement sink for one sweep.

use crossbeam_channel::{unbounded, Receiver, Sender};

use ramp_types::Measurement;

/// Accumulates measurements published by any worker.
///
/// Publishing goes through a lock-free channel, independent of the sweep
/// lock. [`ResultCollector::drain`] consumes the collector, so it can only
/// be called once.
#[derive(Debug)]
pub struct ResultCollector {
    tx: Sender<Measurement>,
    rx: Receiver<Measurement>,
}

/// Cloneable publishing end handed to workers.
#[derive(Debug, Clone)]
pub struct MeasurementSink {
    tx: Sender<Measurement>,
}

impl MeasurementSink {
    pub fn publish(&self, measurement: Measurement) {
        // The receiver is owned by the collector, which outlives every worker.
        let _ = self.tx.send(measurement);
    }
}

impl ResultCollector {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sink(&self) -> MeasurementSink {
        MeasurementSink {
            tx: self.tx.clone(),
        }
    }

    /// Number of measurements published so far.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Everything published so far, in arrival order.
    pub fn drain(self) -> Vec<Measurement> {
        let Self { tx, rx } = self;
        drop(tx);
        rx.try_iter().collect()
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}
