//! Orchestration backend
//!
//! - [`TaskQueueBackend`] trait the dispatch loop polls and reports through
//! - [`BackendConnector`] establishing a backend session from an address
//! - [`PostgresBackend`] for production
//! - [`InMemoryBackend`] for tests and local runs

mod address;
mod memory;
mod postgres;
mod queue;

pub use address::BackendAddress;
pub use memory::{BackendCall, InMemoryBackend, InMemoryConnector};
pub use postgres::{PostgresBackend, PostgresConnector};
pub use queue::{
    ActivityTask, BackendConnector, BackendError, HeartbeatResponse, TaskQueueBackend, WorkerInfo,
    WorkflowTask,
};
