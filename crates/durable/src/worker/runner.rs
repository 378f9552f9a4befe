//! Dispatch loop
//!
//! Polls the backend for work items and routes each one to its registered
//! handler: workflow tasks are replayed inline, activity tasks run in
//! execution pool slots.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::pool::{ExecutionPool, PoolError, Slot};
use super::poller::{PollerConfig, TaskPoller};
use crate::activity::{ActivityContext, ActivityError, HeartbeatPayload};
use crate::backend::{ActivityTask, BackendError, TaskQueueBackend, WorkerInfo, WorkflowTask};
use crate::engine::HandlerRegistry;
use crate::workflow::WorkflowError;

/// Buffered heartbeats per running activity
const HEARTBEAT_BUFFER: usize = 16;

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,

    /// Task queue polled by this worker
    pub task_queue: String,

    pub poller: PollerConfig,

    /// Consecutive failed polls after which the loop gives up
    pub max_consecutive_poll_failures: u32,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_queue: task_queue.into(),
            poller: PollerConfig::default(),
            max_consecutive_poll_failures: 5,
        }
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_max_consecutive_poll_failures(mut self, max: u32) -> Self {
        self.max_consecutive_poll_failures = max.max(1);
        self
    }
}

/// Dispatch loop errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to register worker with backend: {0}")]
    Registration(#[source] BackendError),

    #[error("backend unavailable after {failures} consecutive poll failures")]
    Backend {
        failures: u32,
        #[source]
        source: BackendError,
    },

    #[error("execution pool closed while the worker was running")]
    PoolClosed,
}

/// Polls one task queue and dispatches to a frozen handler set
pub struct Worker {
    backend: Arc<dyn TaskQueueBackend>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    workflow_types: Vec<String>,
    activity_types: Vec<String>,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn TaskQueueBackend>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let workflow_types = registry
            .workflow_types()
            .into_iter()
            .map(String::from)
            .collect();
        let activity_types = registry
            .activity_types()
            .into_iter()
            .map(String::from)
            .collect();

        Self {
            backend,
            registry,
            config,
            workflow_types,
            activity_types,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Registration record announced to the backend
    pub fn info(&self, max_concurrency: usize) -> WorkerInfo {
        WorkerInfo {
            id: self.config.worker_id.clone(),
            task_queue: self.config.task_queue.clone(),
            workflow_types: self.workflow_types.clone(),
            activity_types: self.activity_types.clone(),
            max_concurrency: u32::try_from(max_concurrency).unwrap_or(u32::MAX),
            started_at: Utc::now(),
        }
    }

    /// Register, poll until shutdown or failure, then deregister
    ///
    /// Returns `Ok` when `shutdown_rx` signals `true` (or its sender is
    /// dropped). Activities still running in `pool` are left to the caller
    /// to drain.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id, task_queue = %self.config.task_queue))]
    pub async fn run(
        &self,
        pool: &ExecutionPool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        self.backend
            .register_worker(&self.info(pool.capacity()))
            .await
            .map_err(WorkerError::Registration)?;

        info!(
            workflow_types = ?self.workflow_types,
            activity_types = ?self.activity_types,
            capacity = pool.capacity(),
            "Worker registered, polling"
        );

        let result = self.poll_loop(pool, shutdown_rx).await;

        if let Err(e) = self.backend.deregister_worker(&self.config.worker_id).await {
            warn!(error = %e, "Failed to deregister worker");
        }

        match &result {
            Ok(()) => info!("Worker stopped"),
            Err(e) => error!(error = %e, "Worker stopped with error"),
        }
        result
    }

    async fn poll_loop(
        &self,
        pool: &ExecutionPool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let mut poller = TaskPoller::new(self.config.poller.clone(), shutdown_rx);
        let mut failures = 0u32;

        loop {
            if poller.is_shutdown() {
                debug!("Shutdown requested");
                return Ok(());
            }

            let mut found = 0;
            let mut poll_error = None;

            if !self.workflow_types.is_empty() {
                match self.poll_workflows(poller.batch_size()).await {
                    Ok(tasks) => {
                        found += tasks.len();
                        for task in tasks {
                            self.process_workflow_task(task).await;
                        }
                    }
                    Err(e) => poll_error = Some(e),
                }
            }

            if !self.activity_types.is_empty() {
                // A full pool skips the activity poll, workflows keep flowing
                let mut slots = Vec::new();
                while slots.len() < poller.batch_size() {
                    match pool.try_acquire() {
                        Ok(slot) => slots.push(slot),
                        Err(PoolError::Full) => break,
                        Err(_) => return Err(WorkerError::PoolClosed),
                    }
                }

                if slots.is_empty() {
                    debug!(in_flight = pool.in_flight(), "Execution pool full, skipping activity poll");
                } else {
                    match self.poll_activities(slots.len()).await {
                        Ok(tasks) => {
                            found += tasks.len();
                            for task in tasks {
                                match slots.pop() {
                                    Some(slot) => self.dispatch_activity(pool, slot, task),
                                    None => self.hand_back_activity(task).await,
                                }
                            }
                        }
                        Err(e) => {
                            poll_error.get_or_insert(e);
                        }
                    }
                }
            }

            match poll_error {
                Some(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Backend poll failed");
                    if failures >= self.config.max_consecutive_poll_failures {
                        return Err(WorkerError::Backend {
                            failures,
                            source: e,
                        });
                    }
                    poller.observe_failure();
                }
                None => {
                    failures = 0;
                    poller.observe(found);
                }
            }

            if found == 0 && poller.wait().await {
                debug!("Shutdown requested");
                return Ok(());
            }
        }
    }

    async fn poll_workflows(&self, max_tasks: usize) -> Result<Vec<WorkflowTask>, BackendError> {
        self.backend
            .poll_workflow_tasks(
                &self.config.task_queue,
                &self.config.worker_id,
                &self.workflow_types,
                max_tasks,
            )
            .await
    }

    async fn poll_activities(&self, max_tasks: usize) -> Result<Vec<ActivityTask>, BackendError> {
        self.backend
            .poll_activity_tasks(
                &self.config.task_queue,
                &self.config.worker_id,
                &self.activity_types,
                max_tasks,
            )
            .await
    }

    /// Replay a workflow task and hand its commands back
    #[instrument(skip_all, fields(task_id = %task.id, workflow_type = %task.workflow_type))]
    async fn process_workflow_task(&self, task: WorkflowTask) {
        let WorkflowTask {
            id,
            workflow_type,
            input,
            history,
            ..
        } = task;

        let replay = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.replay_workflow(&workflow_type, input, &history)
        }));

        let reported = match replay {
            Ok(Ok(actions)) => {
                debug!(actions = actions.len(), "Workflow task replayed");
                self.backend.complete_workflow_task(id, actions).await
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Workflow replay failed");
                let error = WorkflowError::new(e.to_string()).with_code("REPLAY_FAILED");
                self.backend.fail_workflow_task(id, &error).await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Workflow handler panicked");
                let error =
                    WorkflowError::new(format!("workflow panicked: {message}")).with_code("PANIC");
                self.backend.fail_workflow_task(id, &error).await
            }
        };

        if let Err(e) = reported {
            error!(error = %e, "Failed to report workflow task");
        }
    }

    /// Fail a task claimed beyond the free slots so the backend retries it
    async fn hand_back_activity(&self, task: ActivityTask) {
        warn!(
            task_id = %task.id,
            activity_type = %task.activity_type,
            "Backend returned more activity tasks than requested, handing task back"
        );
        let error = ActivityError::retryable("no free execution slot on this worker")
            .with_type("NO_SLOT");
        if let Err(e) = self.backend.fail_activity_task(task.id, &error).await {
            error!(task_id = %task.id, error = %e, "Failed to hand back activity task");
        }
    }

    fn dispatch_activity(&self, pool: &ExecutionPool, slot: Slot, task: ActivityTask) {
        debug!(task_id = %task.id, activity_type = %task.activity_type, "Dispatching activity");

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let worker_id = self.config.worker_id.clone();

        pool.spawn(slot, run_activity(backend, registry, worker_id, task));
    }
}

/// Execute one activity attempt and report its outcome
#[instrument(skip_all, fields(task_id = %task.id, activity_type = %task.activity_type, attempt = task.attempt))]
async fn run_activity(
    backend: Arc<dyn TaskQueueBackend>,
    registry: Arc<HandlerRegistry>,
    worker_id: String,
    task: ActivityTask,
) {
    let ActivityTask {
        id,
        workflow_id,
        activity_id,
        activity_type,
        input,
        attempt,
        max_attempts,
    } = task;

    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(HEARTBEAT_BUFFER);
    let ctx = ActivityContext::new(id, workflow_id, activity_id, attempt, max_attempts)
        .with_heartbeat(heartbeat_tx);
    let cancel = ctx.cancellation_handle();

    let execution = AssertUnwindSafe(registry.execute_activity(&activity_type, &ctx, input))
        .catch_unwind();
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            outcome = &mut execution => break outcome,
            Some(heartbeat) = heartbeat_rx.recv() => {
                if forward_heartbeat(backend.as_ref(), id, &worker_id, heartbeat).await {
                    info!("Backend requested cancellation");
                    cancel.cancel();
                }
            }
        }
    };

    let outcome = outcome.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(panic = %message, "Activity handler panicked");
        Err(ActivityError::non_retryable(format!("activity panicked: {message}")).with_type("PANIC"))
    });

    let reported = match outcome {
        Ok(result) => {
            debug!("Activity completed");
            backend.complete_activity_task(id, result).await
        }
        Err(error) => {
            warn!(error = %error, retryable = error.retryable, "Activity failed");
            backend.fail_activity_task(id, &error).await
        }
    };

    if let Err(e) = reported {
        error!(error = %e, "Failed to report activity outcome");
    }
}

/// Returns whether the backend asked for cancellation
async fn forward_heartbeat(
    backend: &dyn TaskQueueBackend,
    task_id: Uuid,
    worker_id: &str,
    heartbeat: HeartbeatPayload,
) -> bool {
    match backend
        .heartbeat_activity(task_id, worker_id, heartbeat.details)
        .await
    {
        Ok(response) => response.should_cancel,
        Err(e) => {
            warn!(error = %e, "Failed to forward heartbeat");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
