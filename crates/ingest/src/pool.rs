//! Bounded task pool.
//!
//! A slot must be acquired before a task is spawned; acquiring waits while
//! all slots are taken, which is how the dispatcher applies backpressure to
//! polling. The slot travels into the task and is released when the task
//! ends, whether it returns or panics.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};

/// Permission to run one task.
pub struct Slot(OwnedSemaphorePermit);

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_counter(capacity, Arc::new(AtomicUsize::new(0)))
    }

    /// Share the in-flight counter with an observer.
    pub fn with_counter(capacity: usize, in_flight: Arc<AtomicUsize>) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
            in_flight,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, AcquireError> {
        self.permits.clone().acquire_owned().await.map(Slot)
    }

    pub fn spawn<F>(&mut self, slot: Slot, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let guard = InFlight::enter(&self.in_flight);
        self.tasks.spawn(async move {
            let _slot = slot;
            let _guard = guard;
            task.await
        });
    }

    /// Collect results of tasks that have already finished.
    pub fn reap(&mut self) -> Vec<Result<T, JoinError>> {
        let mut done = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            done.push(result);
        }
        done
    }

    /// Wait for every spawned task.
    pub async fn join(&mut self) -> Vec<Result<T, JoinError>> {
        let mut done = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            done.push(result);
        }
        done
    }
}
