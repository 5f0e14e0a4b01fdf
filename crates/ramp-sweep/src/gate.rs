//! Counting admission gate bounding concurrent work.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity slot gate. Used per sweep (speculation limit) and per pool
/// (outer experiment limit).
///
/// Waiters are served in FIFO order, so no acquirer is starved while permits
/// keep being released.
#[derive(Debug, Clone)]
pub struct WorkerSlotGate {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of capacity. Released when dropped.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    /// Return the slot to the gate.
    pub fn release(self) {}
}

impl WorkerSlotGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. Returns `None` once the gate has been closed.
    pub async fn acquire(&self) -> Option<SlotPermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| SlotPermit { _permit: permit })
    }

    /// Fail every pending and future `acquire`. Permits already handed out
    /// stay valid until dropped.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_outstanding_permits() {
        let gate = WorkerSlotGate::new(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);
        assert_eq!(gate.available(), 0);

        a.release();
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let gate = WorkerSlotGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn close_wakes_pending_acquirers() {
        let gate = WorkerSlotGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        gate.close();
        assert!(waiter.await.unwrap());

        held.release();
        assert!(gate.acquire().await.is_none());
    }
}
