//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (task finished or worker stopping)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    #[error("activity was cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Context handed to an activity for one execution attempt
///
/// Carries the attempt metadata, a heartbeat channel the worker forwards to
/// the backend, and a cancellation flag the worker raises when the backend
/// asks for it.
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     tokio::select! {
///         out = call_service(input) => out,
///         _ = ctx.cancelled() => Err(ActivityError::non_retryable("cancelled")),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Backend task ID of this attempt
    pub task_id: Uuid,

    /// Attempt number (1-based)
    pub attempt: u32,

    pub max_attempts: u32,

    /// Workflow that scheduled the activity
    pub workflow_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,
    cancel: Arc<CancelState>,
}

impl ActivityContext {
    pub fn new(
        task_id: Uuid,
        workflow_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            attempt,
            max_attempts,
            workflow_id,
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancel: Arc::new(CancelState::default()),
        }
    }

    /// Attach a heartbeat channel
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Handle the worker keeps to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Record a heartbeat
    ///
    /// Fails if the activity was cancelled or the worker stopped listening.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.flag.load(Ordering::Acquire)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancel: Arc<CancelState>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancel.flag.store(true, Ordering::Release);
        self.cancel.notify.notify_waiters();
    }
}
