//! Bounds simultaneous GPU-bound dispatches.
//!
//! A counting semaphore with a fair FIFO wait queue. Capacity reflects
//! the GPU memory budget and arrives as configuration, never derived
//! here. Acquisition is cancellable: a waiter whose acquire
//! future is dropped leaves the queue and can never later hold an unused
//! permit. The scheduler's dispatch path is the only caller; no bypass
//! path exists.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Lease on one unit of GPU concurrency. Released on drop.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

pub struct ConcurrencyGate {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Wait FIFO for a free permit.
    pub async fn acquire(&self) -> GatePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");
        GatePermit { _permit: permit }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently leased to in-flight dispatches.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
