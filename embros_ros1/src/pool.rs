//! Admission gates bounding how many connection workers of each class run
//! at once.
//!
//! Capacity is fixed at node init. Inbound listeners use [`WorkerPool::try_admit`]
//! and close the socket when the pool is exhausted; outbound client workers
//! use [`WorkerPool::admit`] and wait for a slot. A permit travels with its
//! worker and releases the slot when the worker exits.

use log::*;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub(crate) struct WorkerPool {
    name: &'static str,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Takes a slot immediately, or reports exhaustion.
    pub(crate) fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("{} worker pool exhausted, rejecting connection", self.name);
                None
            }
        }
    }

    /// Waits for a slot.
    pub(crate) async fn admit(&self) -> OwnedSemaphorePermit {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn capacity_bounds_admission() {
        let pool = WorkerPool::new("test", 2);
        let first = pool.try_admit().unwrap();
        let _second = pool.try_admit().unwrap();
        assert!(pool.try_admit().is_none());
        drop(first);
        assert!(pool.try_admit().is_some());
    }

    #[tokio::test]
    async fn admit_waits_for_a_slot() {
        let pool = WorkerPool::new("test", 1);
        let held = pool.try_admit().unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.admit().await })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
    }
}
