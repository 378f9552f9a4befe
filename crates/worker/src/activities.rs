// Activity implementations
//
// The six activities the worker registers. MCP activities delegate to the
// shared McpManager; service activities POST JSON to the model, image and
// ingestion services through one ServiceClient.
//
// Decision: retry classification happens here, the backend decides whether
// and when to retry. 5xx, timeouts and connection failures are retryable;
// 4xx and missing configuration are not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maap_durable::activity::{Activity, ActivityContext, ActivityError, HeartbeatError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::mcp::{McpError, McpManager};

/// MCP server the memory and cache tools live on unless a request names another
pub const DEFAULT_MCP_SERVER: &str = "ai-memory";

const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) fn default_mcp_server() -> String {
    DEFAULT_MCP_SERVER.to_string()
}

fn cancelled() -> ActivityError {
    ActivityError::non_retryable("activity cancelled").with_type("CANCELLED")
}

// ============================================================================
// HTTP services
// ============================================================================

/// JSON client for the model, image and ingestion services
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(DEFAULT_SERVICE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// POST `body` to `endpoint` and return the JSON response
    ///
    /// Gives up early when the backend cancels the activity.
    pub async fn post_json<B: Serialize + Sync>(
        &self,
        ctx: &ActivityContext,
        service: &str,
        endpoint: Option<&str>,
        body: &B,
    ) -> Result<Value, ActivityError> {
        let endpoint = endpoint.ok_or_else(|| {
            ActivityError::non_retryable(format!("{service} service URL is not configured"))
                .with_type("NOT_CONFIGURED")
        })?;
        let url = Url::parse(endpoint).map_err(|e| {
            ActivityError::non_retryable(format!("invalid {service} service URL: {e}"))
                .with_type("NOT_CONFIGURED")
        })?;

        debug!(service, url = %url, attempt = ctx.attempt, "Calling service");

        tokio::select! {
            result = self.send(service, url, body) => result,
            _ = ctx.cancelled() => Err(cancelled()),
        }
    }

    async fn send<B: Serialize>(
        &self,
        service: &str,
        url: Url,
        body: &B,
    ) -> Result<Value, ActivityError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(service, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let error = format!("{service} service returned HTTP {}: {message}", status.as_u16());
            return Err(if status.is_server_error() {
                ActivityError::retryable(error).with_type("SERVICE_UNAVAILABLE")
            } else {
                ActivityError::non_retryable(error).with_type("SERVICE_REJECTED")
            });
        }

        response.json().await.map_err(|e| {
            ActivityError::non_retryable(format!("{service} service returned invalid JSON: {e}"))
                .with_type("INVALID_RESPONSE")
        })
    }
}

fn transport_error(service: &str, err: reqwest::Error) -> ActivityError {
    let message = format!("{service} service request failed: {err}");
    if err.is_timeout() || err.is_connect() {
        ActivityError::retryable(message).with_type("TRANSPORT")
    } else {
        ActivityError::non_retryable(message).with_type("TRANSPORT")
    }
}

/// Input of `invoke_bedrock`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInvocation {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

/// Generate text through the model invocation service
pub struct InvokeBedrock {
    client: ServiceClient,
    endpoint: Option<String>,
}

impl InvokeBedrock {
    pub fn new(client: ServiceClient, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Activity for InvokeBedrock {
    const TYPE: &'static str = "invoke_bedrock";
    type Input = ModelInvocation;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ModelInvocation,
    ) -> Result<Value, ActivityError> {
        info!(model_id = ?input.model_id, "Invoking model");
        self.client
            .post_json(ctx, "model", self.endpoint.as_deref(), &input)
            .await
    }
}

/// Input of `process_image`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRequest {
    pub image_url: String,
    #[serde(default)]
    pub operations: Vec<String>,
}

/// Analyze or transform an image through the image service
pub struct ProcessImage {
    client: ServiceClient,
    endpoint: Option<String>,
}

impl ProcessImage {
    pub fn new(client: ServiceClient, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Activity for ProcessImage {
    const TYPE: &'static str = "process_image";
    type Input = ImageRequest;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ImageRequest,
    ) -> Result<Value, ActivityError> {
        self.client
            .post_json(ctx, "image", self.endpoint.as_deref(), &input)
            .await
    }
}

/// Input of `ingest_data_activity`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    pub source: String,
    #[serde(default)]
    pub documents: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
}

/// Hand documents to the ingestion service
pub struct IngestData {
    client: ServiceClient,
    endpoint: Option<String>,
}

impl IngestData {
    pub fn new(client: ServiceClient, endpoint: Option<String>) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Activity for IngestData {
    const TYPE: &'static str = "ingest_data_activity";
    type Input = IngestRequest;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: IngestRequest,
    ) -> Result<Value, ActivityError> {
        info!(source = %input.source, documents = input.documents.len(), "Ingesting data");
        // Large batches can run long; report progress before the call
        let progress = serde_json::json!({ "documents": input.documents.len() });
        if let Err(HeartbeatError::Cancelled) = ctx.heartbeat(Some(progress)).await {
            return Err(cancelled());
        }
        self.client
            .post_json(ctx, "ingest", self.endpoint.as_deref(), &input)
            .await
    }
}

// ============================================================================
// MCP
// ============================================================================

fn mcp_error(err: McpError) -> ActivityError {
    let retryable = err.is_retryable();
    let message = err.to_string();
    let error = if retryable {
        ActivityError::retryable(message)
    } else {
        ActivityError::non_retryable(message)
    };
    error.with_type("MCP_ERROR")
}

async fn until_cancelled<F>(ctx: &ActivityContext, call: F) -> Result<Value, ActivityError>
where
    F: std::future::Future<Output = Result<Value, McpError>>,
{
    tokio::select! {
        result = call => result.map_err(mcp_error),
        _ = ctx.cancelled() => Err(cancelled()),
    }
}

/// Input of `mcp_call_tool`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpToolCall {
    #[serde(default = "default_mcp_server")]
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

pub struct McpCallTool {
    mcp: Arc<McpManager>,
}

impl McpCallTool {
    pub fn new(mcp: Arc<McpManager>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Activity for McpCallTool {
    const TYPE: &'static str = "mcp_call_tool";
    type Input = McpToolCall;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: McpToolCall,
    ) -> Result<Value, ActivityError> {
        debug!(server = %input.server, tool = %input.tool, "Calling MCP tool");
        until_cancelled(
            ctx,
            self.mcp.call_tool(&input.server, &input.tool, input.arguments),
        )
        .await
    }
}

/// Input of `mcp_read_resource`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpResourceRead {
    #[serde(default = "default_mcp_server")]
    pub server: String,
    pub uri: String,
}

pub struct McpReadResource {
    mcp: Arc<McpManager>,
}

impl McpReadResource {
    pub fn new(mcp: Arc<McpManager>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Activity for McpReadResource {
    const TYPE: &'static str = "mcp_read_resource";
    type Input = McpResourceRead;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: McpResourceRead,
    ) -> Result<Value, ActivityError> {
        until_cancelled(ctx, self.mcp.read_resource(&input.server, &input.uri)).await
    }
}

/// Input of `mcp_get_prompt`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpPromptRequest {
    #[serde(default = "default_mcp_server")]
    pub server: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

pub struct McpGetPrompt {
    mcp: Arc<McpManager>,
}

impl McpGetPrompt {
    pub fn new(mcp: Arc<McpManager>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Activity for McpGetPrompt {
    const TYPE: &'static str = "mcp_get_prompt";
    type Input = McpPromptRequest;
    type Output = Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: McpPromptRequest,
    ) -> Result<Value, ActivityError> {
        until_cancelled(
            ctx,
            self.mcp.get_prompt(&input.server, &input.name, input.arguments),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), Uuid::now_v7(), "step-1", 1, 3)
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_configured() {
        let activity = InvokeBedrock::new(ServiceClient::new().unwrap(), None);
        let input = ModelInvocation {
            prompt: "hello".into(),
            model_id: None,
            parameters: Value::Null,
        };

        let err = activity.execute(&ctx(), input).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("NOT_CONFIGURED"));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_not_configured() {
        let activity = ProcessImage::new(ServiceClient::new().unwrap(), Some("::nope".into()));
        let input = ImageRequest {
            image_url: "s3://bucket/cat.png".into(),
            operations: vec![],
        };

        let err = activity.execute(&ctx(), input).await.unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("NOT_CONFIGURED"));
    }

    #[test]
    fn test_tool_call_defaults_server() {
        let call: McpToolCall =
            serde_json::from_value(json!({ "tool": "retrieve_memory" })).unwrap();
        assert_eq!(call.server, DEFAULT_MCP_SERVER);
        assert_eq!(call.arguments, Value::Null);
    }

    #[test]
    fn test_mcp_error_classification() {
        let err = mcp_error(McpError::Status {
            server: "ai-memory".into(),
            status: 502,
            message: "bad gateway".into(),
        });
        assert!(err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("MCP_ERROR"));

        assert!(!mcp_error(McpError::UnknownServer("x".into())).retryable);
    }
}
