//! Handler registry
//!
//! Maps workflow and activity type names to type-erased handlers. The
//! registry is assembled through [`HandlerRegistryBuilder`] and frozen by
//! `build()`; there is no way to add handlers afterwards, so a worker that
//! holds an `Arc<HandlerRegistry>` knows its handler set is final.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::workflow::{Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowSignal};

/// Type-erased workflow interface
///
/// All parameters and results cross this boundary as JSON.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self) -> Vec<WorkflowAction>;

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction>;

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction>;

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction>;

    fn is_completed(&self) -> bool;

    /// Result as JSON, if completed successfully
    fn result_json(&self) -> Option<Value>;

    fn error(&self) -> Option<WorkflowError>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.inner.on_start()
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        self.inner.on_activity_completed(activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_failed(activity_id, error)
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        self.inner.on_timer_fired(timer_id)
    }

    fn on_signal(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        self.inner.on_signal(signal)
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn result_json(&self) -> Option<Value> {
        self.inner
            .result()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
    }

    fn error(&self) -> Option<WorkflowError> {
        self.inner.error()
    }
}

/// Type-erased activity interface
#[async_trait]
pub trait AnyActivity: Send + Sync {
    fn activity_type(&self) -> &'static str;

    async fn execute_json(&self, ctx: &ActivityContext, input: Value)
        -> Result<Value, ActivityError>;
}

struct ActivityWrapper<A: Activity> {
    inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn activity_type(&self) -> &'static str {
        A::TYPE
    }

    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let typed: A::Input = serde_json::from_value(input).map_err(ActivityError::invalid_input)?;
        let output = self.inner.execute(ctx, typed).await?;

        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("failed to serialize activity output: {e}"))
                .with_type("INVALID_OUTPUT")
        })
    }
}

/// Factory that creates a workflow instance from JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Which half of the registry a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Workflow,
    Activity,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Activity => write!(f, "activity"),
        }
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow type registered twice: {0}")]
    DuplicateWorkflow(String),

    #[error("activity type registered twice: {0}")]
    DuplicateActivity(String),

    #[error("handler registry is empty")]
    Empty,

    /// A declared identity has no registered handler
    #[error("{kind} type is not registered: {name}")]
    Unresolved { kind: HandlerKind, name: String },

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// Collects handlers before they are frozen into a [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    workflows: Vec<(&'static str, WorkflowFactory)>,
    activities: Vec<(&'static str, Arc<dyn AnyActivity>)>,
}

impl HandlerRegistryBuilder {
    /// Register a workflow type
    pub fn workflow<W: Workflow>(mut self) -> Self {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            Ok(Box::new(WorkflowWrapper {
                inner: W::new(typed_input),
            }) as Box<dyn AnyWorkflow>)
        });

        self.workflows.push((W::TYPE, factory));
        self
    }

    /// Register an activity implementation
    pub fn activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities
            .push((A::TYPE, Arc::new(ActivityWrapper { inner: activity })));
        self
    }

    /// Freeze the handler set
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        if self.workflows.is_empty() && self.activities.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut workflows = HashMap::with_capacity(self.workflows.len());
        for (name, factory) in self.workflows {
            if workflows.insert(name, factory).is_some() {
                return Err(RegistryError::DuplicateWorkflow(name.to_string()));
            }
        }

        let mut activities = HashMap::with_capacity(self.activities.len());
        for (name, activity) in self.activities {
            if activities.insert(name, activity).is_some() {
                return Err(RegistryError::DuplicateActivity(name.to_string()));
            }
        }

        Ok(HandlerRegistry {
            workflows,
            activities,
        })
    }
}

/// Frozen map from type names to workflow and activity handlers
pub struct HandlerRegistry {
    workflows: HashMap<&'static str, WorkflowFactory>,
    activities: HashMap<&'static str, Arc<dyn AnyActivity>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn contains_workflow(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub fn contains_activity(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Registered workflow type names, sorted
    pub fn workflow_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.workflows.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Registered activity type names, sorted
    pub fn activity_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.activities.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Check that every declared identity has a handler
    pub fn ensure_resolvable(
        &self,
        workflows: &[&str],
        activities: &[&str],
    ) -> Result<(), RegistryError> {
        if let Some(name) = workflows.iter().find(|w| !self.contains_workflow(w)) {
            return Err(RegistryError::Unresolved {
                kind: HandlerKind::Workflow,
                name: name.to_string(),
            });
        }

        if let Some(name) = activities.iter().find(|a| !self.contains_activity(a)) {
            return Err(RegistryError::Unresolved {
                kind: HandlerKind::Activity,
                name: name.to_string(),
            });
        }

        Ok(())
    }

    /// Create a workflow instance from type name and JSON input
    pub fn create_workflow(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .workflows
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    /// Rebuild a workflow from its history and return its newest commands
    ///
    /// With an empty history the commands are those of `on_start`; otherwise
    /// they are the ones produced by the last history event. Events after the
    /// workflow has completed are ignored.
    pub fn replay_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        history: &[WorkflowEvent],
    ) -> Result<Vec<WorkflowAction>, RegistryError> {
        let mut workflow = self.create_workflow(workflow_type, input)?;
        let mut actions = workflow.on_start();

        for event in history {
            if workflow.is_completed() {
                debug!(workflow_type, "ignoring history after completion");
                break;
            }

            actions = match event {
                WorkflowEvent::ActivityCompleted {
                    activity_id,
                    result,
                } => workflow.on_activity_completed(activity_id, result.clone()),
                WorkflowEvent::ActivityFailed { activity_id, error } => {
                    workflow.on_activity_failed(activity_id, error)
                }
                WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(timer_id),
                WorkflowEvent::SignalReceived { signal } => workflow.on_signal(signal),
            };
        }

        Ok(actions)
    }

    /// Run an activity by type name
    pub async fn execute_activity(
        &self,
        activity_type: &str,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let activity = self.activities.get(activity_type).ok_or_else(|| {
            ActivityError::non_retryable(format!("unknown activity type: {activity_type}"))
                .with_type("UNKNOWN_ACTIVITY")
        })?;

        activity.execute_json(ctx, input).await
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("workflow_types", &self.workflow_types())
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestInput {
        value: i32,
    }

    struct DoublingWorkflow {
        input: TestInput,
        result: Option<i32>,
        error: Option<WorkflowError>,
    }

    impl Workflow for DoublingWorkflow {
        const TYPE: &'static str = "doubling_workflow";
        type Input = TestInput;
        type Output = i32;

        fn new(input: Self::Input) -> Self {
            Self {
                input,
                result: None,
                error: None,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "double",
                "double",
                json!({ "value": self.input.value }),
            )]
        }

        fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> Vec<WorkflowAction> {
            let r: i32 = serde_json::from_value(result).unwrap_or(0);
            self.result = Some(r);
            vec![WorkflowAction::complete(json!(r))]
        }

        fn on_activity_failed(
            &mut self,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            let error = WorkflowError::new(&error.message);
            self.error = Some(error.clone());
            vec![WorkflowAction::fail(error)]
        }

        fn is_completed(&self) -> bool {
            self.result.is_some() || self.error.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            self.result
        }

        fn error(&self) -> Option<WorkflowError> {
            self.error.clone()
        }
    }

    struct DoubleActivity;

    #[async_trait]
    impl Activity for DoubleActivity {
        const TYPE: &'static str = "double";
        type Input = TestInput;
        type Output = i32;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(input.value * 2)
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .workflow::<DoublingWorkflow>()
            .activity(DoubleActivity)
            .build()
            .unwrap()
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), Uuid::now_v7(), "double", 1, 3)
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = registry();

        assert!(registry.contains_workflow("doubling_workflow"));
        assert!(registry.contains_activity("double"));
        assert!(!registry.contains_workflow("double"));
        assert_eq!(registry.workflow_types(), vec!["doubling_workflow"]);
        assert_eq!(registry.activity_types(), vec!["double"]);
    }

    #[test]
    fn test_empty_registry_rejected() {
        let result = HandlerRegistry::builder().build();
        assert!(matches!(result, Err(RegistryError::Empty)));
    }

    #[test]
    fn test_duplicates_rejected() {
        let result = HandlerRegistry::builder()
            .workflow::<DoublingWorkflow>()
            .workflow::<DoublingWorkflow>()
            .build();
        assert!(matches!(result, Err(RegistryError::DuplicateWorkflow(name)) if name == "doubling_workflow"));

        let result = HandlerRegistry::builder()
            .activity(DoubleActivity)
            .activity(DoubleActivity)
            .build();
        assert!(matches!(result, Err(RegistryError::DuplicateActivity(name)) if name == "double"));
    }

    #[test]
    fn test_ensure_resolvable() {
        let registry = registry();

        assert!(registry
            .ensure_resolvable(&["doubling_workflow"], &["double"])
            .is_ok());

        let err = registry
            .ensure_resolvable(&["doubling_workflow"], &["triple"])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Unresolved { kind: HandlerKind::Activity, ref name } if name == "triple"
        ));
        assert_eq!(err.to_string(), "activity type is not registered: triple");
    }

    #[test]
    fn test_replay_without_history_starts_workflow() {
        let actions = registry()
            .replay_workflow("doubling_workflow", json!({ "value": 21 }), &[])
            .unwrap();

        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            WorkflowAction::ScheduleActivity { activity_type, .. } if activity_type == "double"
        ));
    }

    #[test]
    fn test_replay_completed_activity() {
        let history = vec![WorkflowEvent::ActivityCompleted {
            activity_id: "double".into(),
            result: json!(42),
        }];

        let actions = registry()
            .replay_workflow("doubling_workflow", json!({ "value": 21 }), &history)
            .unwrap();

        assert_eq!(actions, vec![WorkflowAction::complete(json!(42))]);
    }

    #[test]
    fn test_replay_ignores_events_after_completion() {
        let history = vec![
            WorkflowEvent::ActivityFailed {
                activity_id: "double".into(),
                error: ActivityError::non_retryable("bad input"),
            },
            WorkflowEvent::ActivityCompleted {
                activity_id: "double".into(),
                result: json!(42),
            },
        ];

        let actions = registry()
            .replay_workflow("doubling_workflow", json!({ "value": 21 }), &history)
            .unwrap();

        assert_eq!(
            actions,
            vec![WorkflowAction::fail(WorkflowError::new("bad input"))]
        );
    }

    #[test]
    fn test_replay_unknown_type_and_bad_input() {
        let registry = registry();

        let result = registry.replay_workflow("unknown", json!({}), &[]);
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));

        let result = registry.replay_workflow("doubling_workflow", json!({}), &[]);
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));
    }

    #[tokio::test]
    async fn test_execute_activity() {
        let output = registry()
            .execute_activity("double", &ctx(), json!({ "value": 4 }))
            .await
            .unwrap();

        assert_eq!(output, json!(8));
    }

    #[tokio::test]
    async fn test_execute_unknown_activity() {
        let err = registry()
            .execute_activity("triple", &ctx(), json!({}))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("UNKNOWN_ACTIVITY"));
    }

    #[tokio::test]
    async fn test_execute_activity_invalid_input() {
        let err = registry()
            .execute_activity("double", &ctx(), json!({ "value": "four" }))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("INVALID_INPUT"));
    }

    #[test]
    fn test_registry_debug() {
        let debug_str = format!("{:?}", registry());
        assert!(debug_str.contains("doubling_workflow"));
        assert!(debug_str.contains("double"));
    }
}
