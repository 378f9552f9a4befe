//! In-memory backend for tests and local runs

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::queue::*;
use super::BackendAddress;
use crate::activity::ActivityError;
use crate::workflow::{WorkflowAction, WorkflowError, WorkflowEvent};

/// One call made against the backend, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    RegisterWorker { worker_id: String },
    DeregisterWorker { worker_id: String },
    PollWorkflowTasks,
    PollActivityTasks,
    CompleteWorkflowTask { task_id: Uuid },
    FailWorkflowTask { task_id: Uuid },
    HeartbeatActivity { task_id: Uuid },
    CompleteActivityTask { task_id: Uuid },
    FailActivityTask { task_id: Uuid },
    Close,
}

#[derive(Default)]
struct State {
    closed: bool,
    workers: HashMap<String, WorkerInfo>,
    workflow_queue: VecDeque<(String, WorkflowTask)>,
    activity_queue: VecDeque<(String, ActivityTask)>,
    claimed: HashMap<Uuid, String>,
    cancel_requested: HashSet<Uuid>,
    workflow_results: HashMap<Uuid, Result<Vec<WorkflowAction>, WorkflowError>>,
    activity_results: HashMap<Uuid, Result<serde_json::Value, ActivityError>>,
    heartbeats: Vec<(Uuid, Option<serde_json::Value>)>,
    poll_failures: usize,
    ignore_poll_limit: bool,
    journal: Vec<BackendCall>,
}

/// In-memory implementation of [`TaskQueueBackend`]
///
/// Tasks are claimed in FIFO order per queue. Every call is appended to a
/// journal so tests can assert on ordering.
///
/// ```
/// use maap_durable::backend::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// assert!(backend.journal().is_empty());
/// ```
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    changed: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a workflow task
    pub fn enqueue_workflow_task(
        &self,
        task_queue: &str,
        workflow_type: &str,
        input: serde_json::Value,
        history: Vec<WorkflowEvent>,
    ) -> Uuid {
        let task = WorkflowTask {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_type: workflow_type.to_string(),
            input,
            history,
        };
        let id = task.id;
        self.mutate(|s| s.workflow_queue.push_back((task_queue.to_string(), task)));
        id
    }

    /// Queue an activity task
    pub fn enqueue_activity_task(
        &self,
        task_queue: &str,
        activity_type: &str,
        input: serde_json::Value,
    ) -> Uuid {
        let task = ActivityTask {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            activity_id: format!("{activity_type}-1"),
            activity_type: activity_type.to_string(),
            input,
            attempt: 1,
            max_attempts: 3,
        };
        let id = task.id;
        self.mutate(|s| s.activity_queue.push_back((task_queue.to_string(), task)));
        id
    }

    /// Ask the worker running `task_id` to cancel it on its next heartbeat
    pub fn request_cancel(&self, task_id: Uuid) {
        self.mutate(|s| {
            s.cancel_requested.insert(task_id);
        });
    }

    /// Make the next `count` polls fail with a database error
    pub fn fail_next_polls(&self, count: usize) {
        self.mutate(|s| s.poll_failures = count);
    }

    /// Hand out every matching activity task regardless of `max_tasks`
    pub fn ignore_poll_limit(&self) {
        self.mutate(|s| s.ignore_poll_limit = true);
    }

    pub fn journal(&self) -> Vec<BackendCall> {
        self.state.lock().journal.clone()
    }

    pub fn registered_workers(&self) -> Vec<WorkerInfo> {
        self.state.lock().workers.values().cloned().collect()
    }

    pub fn workflow_result(
        &self,
        task_id: Uuid,
    ) -> Option<Result<Vec<WorkflowAction>, WorkflowError>> {
        self.state.lock().workflow_results.get(&task_id).cloned()
    }

    pub fn activity_result(
        &self,
        task_id: Uuid,
    ) -> Option<Result<serde_json::Value, ActivityError>> {
        self.state.lock().activity_results.get(&task_id).cloned()
    }

    pub fn heartbeats(&self) -> Vec<(Uuid, Option<serde_json::Value>)> {
        self.state.lock().heartbeats.clone()
    }

    pub fn pending_activity_count(&self) -> usize {
        self.state.lock().activity_queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until `predicate` holds or `timeout` elapses
    ///
    /// Returns whether the predicate held.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if predicate(self) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.notify_waiters();
        result
    }

    fn record(&self, call: BackendCall) -> Result<(), BackendError> {
        self.mutate(|s| {
            if s.closed {
                return Err(BackendError::Closed);
            }
            s.journal.push(call);
            Ok(())
        })
    }

    fn take_poll_failure(state: &mut State) -> Result<(), BackendError> {
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(BackendError::Database("injected poll failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueueBackend for InMemoryBackend {
    async fn register_worker(&self, worker: &WorkerInfo) -> Result<(), BackendError> {
        self.record(BackendCall::RegisterWorker {
            worker_id: worker.id.clone(),
        })?;
        self.mutate(|s| s.workers.insert(worker.id.clone(), worker.clone()));
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.record(BackendCall::DeregisterWorker {
            worker_id: worker_id.to_string(),
        })?;
        self.mutate(|s| s.workers.remove(worker_id));
        Ok(())
    }

    async fn poll_workflow_tasks(
        &self,
        task_queue: &str,
        _worker_id: &str,
        workflow_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<WorkflowTask>, BackendError> {
        self.record(BackendCall::PollWorkflowTasks)?;
        self.mutate(|s| {
            Self::take_poll_failure(s)?;

            let mut claimed = Vec::new();
            let mut remaining = VecDeque::with_capacity(s.workflow_queue.len());
            while let Some((queue, task)) = s.workflow_queue.pop_front() {
                if claimed.len() < max_tasks
                    && queue == task_queue
                    && workflow_types.contains(&task.workflow_type)
                {
                    claimed.push(task);
                } else {
                    remaining.push_back((queue, task));
                }
            }
            s.workflow_queue = remaining;
            Ok(claimed)
        })
    }

    async fn complete_workflow_task(
        &self,
        task_id: Uuid,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::CompleteWorkflowTask { task_id })?;
        self.mutate(|s| s.workflow_results.insert(task_id, Ok(actions)));
        Ok(())
    }

    async fn fail_workflow_task(
        &self,
        task_id: Uuid,
        error: &WorkflowError,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::FailWorkflowTask { task_id })?;
        self.mutate(|s| s.workflow_results.insert(task_id, Err(error.clone())));
        Ok(())
    }

    async fn poll_activity_tasks(
        &self,
        task_queue: &str,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, BackendError> {
        self.record(BackendCall::PollActivityTasks)?;
        self.mutate(|s| {
            Self::take_poll_failure(s)?;

            let limit = if s.ignore_poll_limit { usize::MAX } else { max_tasks };
            let mut claimed = Vec::new();
            let mut remaining = VecDeque::with_capacity(s.activity_queue.len());
            while let Some((queue, task)) = s.activity_queue.pop_front() {
                if claimed.len() < limit
                    && queue == task_queue
                    && activity_types.contains(&task.activity_type)
                {
                    s.claimed.insert(task.id, worker_id.to_string());
                    claimed.push(task);
                } else {
                    remaining.push_back((queue, task));
                }
            }
            s.activity_queue = remaining;
            Ok(claimed)
        })
    }

    async fn heartbeat_activity(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, BackendError> {
        self.record(BackendCall::HeartbeatActivity { task_id })?;
        self.mutate(|s| {
            let owned = s.claimed.get(&task_id).map(String::as_str) == Some(worker_id);
            if !owned {
                return Err(BackendError::TaskNotFound(task_id));
            }

            s.heartbeats.push((task_id, details));
            Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: s.cancel_requested.contains(&task_id),
            })
        })
    }

    async fn complete_activity_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::CompleteActivityTask { task_id })?;
        self.mutate(|s| {
            s.claimed.remove(&task_id);
            s.activity_results.insert(task_id, Ok(result));
        });
        Ok(())
    }

    async fn fail_activity_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::FailActivityTask { task_id })?;
        self.mutate(|s| {
            s.claimed.remove(&task_id);
            s.activity_results.insert(task_id, Err(error.clone()));
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.record(BackendCall::Close)?;
        self.mutate(|s| s.closed = true);
        Ok(())
    }
}

/// Connector handing out a shared [`InMemoryBackend`]
pub struct InMemoryConnector {
    backend: Option<Arc<InMemoryBackend>>,
    attempts: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new(backend: Arc<InMemoryBackend>) -> Self {
        Self {
            backend: Some(backend),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Connector whose every connection attempt is refused
    pub fn refusing() -> Self {
        Self {
            backend: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for InMemoryConnector {
    async fn connect(
        &self,
        address: &BackendAddress,
    ) -> Result<Arc<dyn TaskQueueBackend>, BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match &self.backend {
            Some(backend) => Ok(backend.clone() as Arc<dyn TaskQueueBackend>),
            None => Err(BackendError::Connection {
                address: address.to_string(),
                message: "connection refused".into(),
            }),
        }
    }
}
