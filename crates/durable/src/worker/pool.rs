//! Bounded execution pool for activity tasks
//!
//! A fair counting semaphore gates admission; a task tracker follows every
//! spawned execution so the pool can be drained on release.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Execution pool errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// Admission is closed
    #[error("execution pool is closed")]
    Closed,

    /// No free slot right now
    #[error("execution pool is full")]
    Full,

    #[error("execution pool did not drain in time, {remaining} executions still running")]
    DrainTimeout { remaining: usize },
}

/// A reserved execution slot
///
/// Dropping the slot frees it, including when the execution holding it
/// panics.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Bounded set of concurrent execution slots
///
/// ```ignore
/// let pool = ExecutionPool::new(100);
/// let slot = pool.acquire().await?;
/// pool.spawn(slot, async move { run_activity(task).await });
/// // ...
/// pool.release(Duration::from_secs(30)).await?;
/// ```
#[derive(Debug)]
pub struct ExecutionPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ExecutionPool {
    /// Create a pool with `capacity` slots (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "Execution pool created");

        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
        }
    }

    /// Wait for a free slot, in arrival order
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        Ok(Slot { _permit: permit })
    }

    /// Take a free slot without waiting
    pub fn try_acquire(&self) -> Result<Slot, PoolError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Slot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(PoolError::Full),
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    /// Run `future` in the slot
    ///
    /// The slot is held until the future finishes.
    pub fn spawn<F>(&self, slot: Slot, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(async move {
            let _slot = slot;
            future.await
        })
    }

    /// Wait for a slot, then run `future` in it
    pub async fn submit<F>(&self, future: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = self.acquire().await?;
        Ok(self.spawn(slot, future))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Close admission and wait for running executions to finish
    ///
    /// Waiters blocked in [`acquire`](Self::acquire) fail with
    /// [`PoolError::Closed`]. Calling this again only waits again.
    pub async fn release(&self, timeout: Duration) -> Result<(), PoolError> {
        self.semaphore.close();
        self.tracker.close();

        info!(in_flight = self.tracker.len(), "Draining execution pool");

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Execution pool drained");
                Ok(())
            }
            Err(_) => {
                let remaining = self.tracker.len();
                warn!(remaining, ?timeout, "Execution pool drain timed out");
                Err(PoolError::DrainTimeout { remaining })
            }
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.semaphore.close();
        self.tracker.close();
    }
}
