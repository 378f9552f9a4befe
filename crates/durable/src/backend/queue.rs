//! Task queue backend trait and work item types

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BackendAddress;
use crate::activity::ActivityError;
use crate::workflow::{WorkflowAction, WorkflowError, WorkflowEvent};

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend address: {0}")]
    InvalidAddress(String),

    /// Session could not be established
    #[error("failed to connect to backend at {address}: {message}")]
    Connection { address: String, message: String },

    #[error("timed out after {after:?} connecting to backend at {address}")]
    ConnectTimeout { address: String, after: Duration },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Session was closed by the worker
    #[error("backend connection is closed")]
    Closed,
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Self::Closed,
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// What a worker announces about itself before polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub task_queue: String,
    pub workflow_types: Vec<String>,
    pub activity_types: Vec<String>,
    pub max_concurrency: u32,
    pub started_at: DateTime<Utc>,
}

/// A workflow task: the full history of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub history: Vec<WorkflowEvent>,
}

/// An activity task claimed by this worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Response from an activity heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub accepted: bool,

    /// The backend wants the activity to stop
    pub should_cancel: bool,
}

/// Connection to the orchestration backend
///
/// Implementations are shared across tasks behind an `Arc` and must be
/// safe for concurrent use. Scheduling, retries and persistence are the
/// backend's business; the worker only exchanges work items through this
/// trait.
#[async_trait]
pub trait TaskQueueBackend: Send + Sync + 'static {
    // =========================================================================
    // Worker registration
    // =========================================================================

    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), BackendError>;

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), BackendError>;

    // =========================================================================
    // Workflow tasks
    // =========================================================================

    /// Claim up to `max_tasks` workflow tasks for the given types
    async fn poll_workflow_tasks(
        &self,
        task_queue: &str,
        worker_id: &str,
        workflow_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<WorkflowTask>, BackendError>;

    /// Hand back the commands produced by replaying a workflow task
    async fn complete_workflow_task(
        &self,
        task_id: Uuid,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), BackendError>;

    async fn fail_workflow_task(
        &self,
        task_id: Uuid,
        error: &WorkflowError,
    ) -> Result<(), BackendError>;

    // =========================================================================
    // Activity tasks
    // =========================================================================

    /// Claim up to `max_tasks` activity tasks for the given types
    async fn poll_activity_tasks(
        &self,
        task_queue: &str,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, BackendError>;

    async fn heartbeat_activity(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, BackendError>;

    async fn complete_activity_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), BackendError>;

    async fn fail_activity_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<(), BackendError>;

    // =========================================================================
    // Session
    // =========================================================================

    /// Release the session; later calls fail with [`BackendError::Closed`]
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Establishes backend sessions
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        address: &BackendAddress,
    ) -> Result<Arc<dyn TaskQueueBackend>, BackendError>;
}
