// Workflow definitions
//
// Every registered workflow schedules exactly one activity and completes
// with that activity's result. The shared state machine lives in
// `SingleActivityWorkflow`; each workflow only describes its input and how
// that input becomes the activity call.

use std::marker::PhantomData;
use std::time::Duration;

use maap_durable::activity::ActivityError;
use maap_durable::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::activities::{
    default_mcp_server, ImageRequest, IngestRequest, McpPromptRequest, McpToolCall,
    ModelInvocation,
};

/// Activity id used for the single step of every workflow
pub const STEP_ID: &str = "step-1";

/// Describes a workflow made of one activity call
pub trait SingleActivity: Send + Sync + 'static {
    /// Registered workflow type name
    const TYPE: &'static str;

    /// Activity type the workflow schedules
    const ACTIVITY: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Sync;

    /// Activity input built from the workflow input
    fn activity_input(input: &Self::Input) -> Value;

    fn options() -> ActivityOptions {
        ActivityOptions::default()
    }
}

/// Deterministic state machine running one [`SingleActivity`]
pub struct SingleActivityWorkflow<S: SingleActivity> {
    input: S::Input,
    result: Option<Value>,
    error: Option<WorkflowError>,
    _stage: PhantomData<S>,
}

impl<S: SingleActivity> Workflow for SingleActivityWorkflow<S> {
    const TYPE: &'static str = S::TYPE;
    type Input = S::Input;
    type Output = Value;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            result: None,
            error: None,
            _stage: PhantomData,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::ScheduleActivity {
            activity_id: STEP_ID.to_string(),
            activity_type: S::ACTIVITY.to_string(),
            input: S::activity_input(&self.input),
            options: S::options(),
        }]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        if activity_id != STEP_ID || self.is_completed() {
            return vec![];
        }
        self.result = Some(result.clone());
        vec![WorkflowAction::complete(result)]
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        if activity_id != STEP_ID || self.is_completed() {
            return vec![];
        }
        let code = error.error_type.as_deref().unwrap_or("ACTIVITY_FAILED");
        let failure = WorkflowError::new(error.message.clone()).with_code(code);
        self.error = Some(failure.clone());
        vec![WorkflowAction::fail(failure)]
    }

    fn is_completed(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    fn result(&self) -> Option<Value> {
        self.result.clone()
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}

fn tool_call(server: &str, tool: &str, arguments: Value) -> Value {
    json!(McpToolCall {
        server: server.to_string(),
        tool: tool.to_string(),
        arguments,
    })
}

// ============================================================================
// Service workflows
// ============================================================================

pub struct ImageProcessing;

impl SingleActivity for ImageProcessing {
    const TYPE: &'static str = "ImageProcessingWorkflow";
    const ACTIVITY: &'static str = "process_image";
    type Input = ImageRequest;

    fn activity_input(input: &ImageRequest) -> Value {
        json!(input)
    }
}

pub struct AIGeneration;

impl SingleActivity for AIGeneration {
    const TYPE: &'static str = "AIGenerationWorkflow";
    const ACTIVITY: &'static str = "invoke_bedrock";
    type Input = ModelInvocation;

    fn activity_input(input: &ModelInvocation) -> Value {
        json!(input)
    }
}

pub struct DataIngestion;

impl SingleActivity for DataIngestion {
    const TYPE: &'static str = "DataIngestionWorkflow";
    const ACTIVITY: &'static str = "ingest_data_activity";
    type Input = IngestRequest;

    fn activity_input(input: &IngestRequest) -> Value {
        json!(input)
    }

    // Ingestion batches are large; give them longer and expect heartbeats
    fn options() -> ActivityOptions {
        ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(1800))
            .with_heartbeat(Duration::from_secs(60))
    }
}

// ============================================================================
// MCP workflows
// ============================================================================

/// Input of the semantic cache lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheQuery {
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_mcp_server")]
    pub server: String,
}

pub struct SemanticCacheCheck;

impl SingleActivity for SemanticCacheCheck {
    const TYPE: &'static str = "SemanticCacheCheckWorkflow";
    const ACTIVITY: &'static str = "mcp_call_tool";
    type Input = CacheQuery;

    fn activity_input(input: &CacheQuery) -> Value {
        tool_call(
            &input.server,
            "semantic_cache_check",
            json!({ "query": input.query, "user_id": input.user_id }),
        )
    }
}

/// Input of the cache write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub query: String,
    pub response: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_mcp_server")]
    pub server: String,
}

pub struct CacheStorage;

impl SingleActivity for CacheStorage {
    const TYPE: &'static str = "CacheStorageWorkflow";
    const ACTIVITY: &'static str = "mcp_call_tool";
    type Input = CacheEntry;

    fn activity_input(input: &CacheEntry) -> Value {
        tool_call(
            &input.server,
            "store_cache",
            json!({
                "query": input.query,
                "response": input.response,
                "user_id": input.user_id,
            }),
        )
    }
}

/// Input of the memory lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryQuery {
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default = "default_mcp_server")]
    pub server: String,
}

pub struct MemoryRetrieval;

impl SingleActivity for MemoryRetrieval {
    const TYPE: &'static str = "MemoryRetrievalWorkflow";
    const ACTIVITY: &'static str = "mcp_call_tool";
    type Input = MemoryQuery;

    fn activity_input(input: &MemoryQuery) -> Value {
        tool_call(
            &input.server,
            "retrieve_memory",
            json!({ "user_id": input.user_id, "query": input.query, "limit": input.limit }),
        )
    }
}

/// Input of the memory write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "default_mcp_server")]
    pub server: String,
}

pub struct MemoryStorage;

impl SingleActivity for MemoryStorage {
    const TYPE: &'static str = "MemoryStorageWorkflow";
    const ACTIVITY: &'static str = "mcp_call_tool";
    type Input = MemoryRecord;

    fn activity_input(input: &MemoryRecord) -> Value {
        tool_call(
            &input.server,
            "store_memory",
            json!({
                "user_id": input.user_id,
                "content": input.content,
                "metadata": input.metadata,
            }),
        )
    }
}

pub struct PromptRetrieval;

impl SingleActivity for PromptRetrieval {
    const TYPE: &'static str = "PromptRetrievalWorkflow";
    const ACTIVITY: &'static str = "mcp_get_prompt";
    type Input = McpPromptRequest;

    fn activity_input(input: &McpPromptRequest) -> Value {
        json!(input)
    }
}

pub type ImageProcessingWorkflow = SingleActivityWorkflow<ImageProcessing>;
pub type SemanticCacheCheckWorkflow = SingleActivityWorkflow<SemanticCacheCheck>;
pub type MemoryRetrievalWorkflow = SingleActivityWorkflow<MemoryRetrieval>;
pub type PromptRetrievalWorkflow = SingleActivityWorkflow<PromptRetrieval>;
pub type AIGenerationWorkflow = SingleActivityWorkflow<AIGeneration>;
pub type MemoryStorageWorkflow = SingleActivityWorkflow<MemoryStorage>;
pub type CacheStorageWorkflow = SingleActivityWorkflow<CacheStorage>;
pub type DataIngestionWorkflow = SingleActivityWorkflow<DataIngestion>;

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(actions: &[WorkflowAction]) -> (&str, &Value) {
        match actions {
            [WorkflowAction::ScheduleActivity {
                activity_type,
                input,
                ..
            }] => (activity_type.as_str(), input),
            other => panic!("expected one scheduled activity, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_retrieval_schedules_tool_call() {
        let mut workflow = MemoryRetrievalWorkflow::new(MemoryQuery {
            user_id: "u-1".into(),
            query: "favourite colour".into(),
            limit: Some(3),
            server: default_mcp_server(),
        });

        let actions = workflow.on_start();
        let (activity, input) = scheduled(&actions);
        assert_eq!(activity, "mcp_call_tool");
        assert_eq!(input["server"], "ai-memory");
        assert_eq!(input["tool"], "retrieve_memory");
        assert_eq!(input["arguments"]["limit"], 3);
    }

    #[test]
    fn test_completes_with_activity_result() {
        let mut workflow = ImageProcessingWorkflow::new(ImageRequest {
            image_url: "s3://bucket/cat.png".into(),
            operations: vec!["describe".into()],
        });
        workflow.on_start();

        let actions = workflow.on_activity_completed(STEP_ID, json!({"caption": "a cat"}));
        assert_eq!(actions, vec![WorkflowAction::complete(json!({"caption": "a cat"}))]);
        assert!(workflow.is_completed());
        assert_eq!(workflow.result(), Some(json!({"caption": "a cat"})));
    }

    #[test]
    fn test_activity_failure_fails_workflow() {
        let mut workflow = AIGenerationWorkflow::new(ModelInvocation {
            prompt: "hi".into(),
            model_id: None,
            parameters: Value::Null,
        });
        workflow.on_start();

        let error = ActivityError::non_retryable("model service returned HTTP 400: bad prompt")
            .with_type("SERVICE_REJECTED");
        let actions = workflow.on_activity_failed(STEP_ID, &error);

        match actions.as_slice() {
            [WorkflowAction::FailWorkflow { error }] => {
                assert_eq!(error.message, "model service returned HTTP 400: bad prompt");
                assert_eq!(error.code.as_deref(), Some("SERVICE_REJECTED"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(workflow.error().is_some());
    }

    #[test]
    fn test_ignores_unknown_and_late_events() {
        let mut workflow = CacheStorageWorkflow::new(CacheEntry {
            query: "q".into(),
            response: "r".into(),
            user_id: None,
            server: default_mcp_server(),
        });
        workflow.on_start();

        assert!(workflow.on_activity_completed("other", json!(1)).is_empty());
        assert!(!workflow.is_completed());

        workflow.on_activity_completed(STEP_ID, json!(1));
        assert!(workflow.on_activity_completed(STEP_ID, json!(2)).is_empty());
        assert_eq!(workflow.result(), Some(json!(1)));
    }

    #[test]
    fn test_ingestion_options() {
        let mut workflow = DataIngestionWorkflow::new(IngestRequest {
            source: "s3://bucket/docs".into(),
            documents: vec![],
            metadata: Value::Null,
        });

        match workflow.on_start().as_slice() {
            [WorkflowAction::ScheduleActivity { options, .. }] => {
                assert_eq!(options.heartbeat_timeout, Some(Duration::from_secs(60)));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }
}
