//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{WorkflowAction, WorkflowSignal};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is a deterministic state machine driven by history events
///
/// The worker never keeps workflow instances between tasks: each workflow
/// task builds a fresh instance with [`Workflow::new`], calls
/// [`Workflow::on_start`] and then replays the history. Given the same
/// history a workflow must produce the same actions.
///
/// # Example
///
/// ```ignore
/// struct GreetWorkflow { name: String, done: bool }
///
/// impl Workflow for GreetWorkflow {
///     const TYPE: &'static str = "GreetWorkflow";
///     type Input = GreetInput;
///     type Output = serde_json::Value;
///
///     fn new(input: Self::Input) -> Self {
///         Self { name: input.name, done: false }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity("greet", "greet", json!({"name": self.name}))]
///     }
///
///     // ...
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Registered workflow type name
    const TYPE: &'static str;

    /// Input used to start the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output on successful completion
    type Output: Serialize + DeserializeOwned + Send;

    /// Create an instance from its start input
    fn new(input: Self::Input) -> Self;

    /// Initial commands
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completed successfully
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity failed after the backend gave up retrying
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = signal;
        vec![]
    }

    /// Whether the workflow reached a terminal state
    fn is_completed(&self) -> bool;

    fn result(&self) -> Option<Self::Output>;

    fn error(&self) -> Option<WorkflowError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong").with_code("BROKEN");
        assert_eq!(error.to_string(), "something went wrong");
        assert_eq!(error.code.as_deref(), Some("BROKEN"));
    }
}
