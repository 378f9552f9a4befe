// MAAP worker
//
// The worker process for the MAAP task queue:
// - lifecycle: connect, register, run, tear down
// - mcp: sessions to MCP servers, torn down with the worker
// - workflows / activities: the fixed handler set

pub mod activities;
pub mod lifecycle;
pub mod mcp;
pub mod workflows;

use std::sync::Arc;

use maap_core::WorkerSettings;
use maap_durable::engine::{HandlerRegistry, RegistryError};

pub use activities::ServiceClient;
pub use lifecycle::{
    LifecycleOutcome, LifecycleState, Registrar, ResourceManager, TeardownGuard, WorkerLifecycle,
};
pub use mcp::{McpError, McpManager};

use activities::{
    IngestData, InvokeBedrock, McpCallTool, McpGetPrompt, McpReadResource, ProcessImage,
};
use workflows::{
    AIGenerationWorkflow, CacheStorageWorkflow, DataIngestionWorkflow, ImageProcessingWorkflow,
    MemoryRetrievalWorkflow, MemoryStorageWorkflow, PromptRetrievalWorkflow,
    SemanticCacheCheckWorkflow,
};

/// Workflow types the worker must serve
pub const WORKFLOW_TYPES: &[&str] = &[
    "ImageProcessingWorkflow",
    "SemanticCacheCheckWorkflow",
    "MemoryRetrievalWorkflow",
    "PromptRetrievalWorkflow",
    "AIGenerationWorkflow",
    "MemoryStorageWorkflow",
    "CacheStorageWorkflow",
    "DataIngestionWorkflow",
];

/// Activity types the worker must serve
pub const ACTIVITY_TYPES: &[&str] = &[
    "mcp_call_tool",
    "mcp_read_resource",
    "mcp_get_prompt",
    "invoke_bedrock",
    "process_image",
    "ingest_data_activity",
];

/// Build the fixed handler set
pub fn handler_registry(
    settings: &WorkerSettings,
    mcp: Arc<McpManager>,
    client: ServiceClient,
) -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::builder()
        .workflow::<ImageProcessingWorkflow>()
        .workflow::<SemanticCacheCheckWorkflow>()
        .workflow::<MemoryRetrievalWorkflow>()
        .workflow::<PromptRetrievalWorkflow>()
        .workflow::<AIGenerationWorkflow>()
        .workflow::<MemoryStorageWorkflow>()
        .workflow::<CacheStorageWorkflow>()
        .workflow::<DataIngestionWorkflow>()
        .activity(McpCallTool::new(mcp.clone()))
        .activity(McpReadResource::new(mcp.clone()))
        .activity(McpGetPrompt::new(mcp))
        .activity(InvokeBedrock::new(
            client.clone(),
            settings.model_service_url.clone(),
        ))
        .activity(ProcessImage::new(
            client.clone(),
            settings.image_service_url.clone(),
        ))
        .activity(IngestData::new(client, settings.ingest_service_url.clone()))
        .build()
}
