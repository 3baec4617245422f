//! Bounded worker pools for the pooled substrates.
//!
//! A pool is a semaphore: acquiring a permit admits a run, dropping it
//! readmits the next waiter. Waiters are served in FIFO order, which is
//! what makes queued runs dispatch in creation order.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission control for one pooled substrate.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a worker slot. Tokio semaphores are FIFO-fair, so runs
    /// admit in arrival order.
    pub(crate) async fn admit(&self) -> OwnedSemaphorePermit {
        let waiting = self.semaphore.available_permits() == 0;
        if waiting {
            tracing::debug!(pool = self.name, "pool saturated, run waiting for a slot");
        }
        // Never fails: the semaphore is not closed while the engine lives.
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("worker pool semaphore closed"),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
