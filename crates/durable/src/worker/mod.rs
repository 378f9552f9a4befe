//! Worker runtime
//!
//! - [`ExecutionPool`] bounded activity slots with draining release
//! - [`TaskPoller`] poll pacing with exponential backoff
//! - [`Worker`] the dispatch loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Worker                            │
//! │   register ─▶ poll loop ──────────────────▶ deregister    │
//! │                │                                          │
//! │      workflow tasks           activity tasks              │
//! │      (replayed inline)        (one pool slot each)        │
//! │                │                     │                    │
//! │                ▼                     ▼                    │
//! │         HandlerRegistry        ExecutionPool              │
//! │                                [1] [2] ... [N]            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ```ignore
//! let pool = ExecutionPool::new(settings.max_concurrent_activities);
//! let worker = Worker::new(backend, registry, WorkerConfig::new(worker_id, "maap-task-queue"));
//! worker.run(&pool, shutdown_rx).await?;
//! pool.release(Duration::from_secs(30)).await?;
//! ```

mod poller;
mod pool;
mod runner;

pub use poller::{PollerConfig, TaskPoller};
pub use pool::{ExecutionPool, PoolError, Slot};
pub use runner::{Worker, WorkerConfig, WorkerError};
