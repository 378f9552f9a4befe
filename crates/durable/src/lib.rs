//! # Durable worker engine
//!
//! Building blocks for a task queue worker that talks to a workflow
//! orchestration backend.
//!
//! ## Features
//!
//! - **Deterministic workflows**: workflow tasks are replayed from history into fresh instances
//! - **Activities**: side-effecting work with heartbeats and cancellation
//! - **Frozen handler registry**: the handler set is fixed before the worker polls
//! - **Bounded execution**: a fair semaphore caps concurrent activities; release drains them
//! - **Pluggable backend**: PostgreSQL in production, in-memory for tests
//!
//! ## Example
//!
//! ```ignore
//! use maap_durable::prelude::*;
//!
//! let registry = Arc::new(
//!     HandlerRegistry::builder()
//!         .workflow::<ImageProcessingWorkflow>()
//!         .activity(ProcessImage::new(client, settings.image_service_url.clone()))
//!         .build()?,
//! );
//!
//! let backend = PostgresConnector::new("maap").connect(&"localhost:5432".parse()?).await?;
//! let pool = ExecutionPool::new(100);
//! Worker::new(backend, registry, WorkerConfig::new("worker-1", "maap-task-queue"))
//!     .run(&pool, shutdown_rx)
//!     .await?;
//! ```

pub mod activity;
pub mod backend;
pub mod engine;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::backend::{
        BackendAddress, BackendConnector, BackendError, InMemoryBackend, PostgresConnector,
        TaskQueueBackend,
    };
    pub use crate::engine::{HandlerRegistry, RegistryError};
    pub use crate::worker::{ExecutionPool, PoolError, PollerConfig, Worker, WorkerConfig, WorkerError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
}

pub use activity::{Activity, ActivityContext, ActivityError};
pub use backend::{
    BackendAddress, BackendConnector, BackendError, InMemoryBackend, InMemoryConnector,
    PostgresBackend, PostgresConnector, TaskQueueBackend,
};
pub use engine::{HandlerRegistry, RegistryError};
pub use worker::{ExecutionPool, PoolError, PollerConfig, Worker, WorkerConfig, WorkerError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal,
};
