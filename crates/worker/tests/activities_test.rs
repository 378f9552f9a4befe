//! Activity tests against mocked services

use std::sync::Arc;
use std::time::Duration;

use maap_core::McpServerConfig;
use maap_durable::activity::{Activity, ActivityContext};
use maap_worker::activities::{
    ImageRequest, IngestData, IngestRequest, InvokeBedrock, McpCallTool, McpToolCall,
    ModelInvocation, ProcessImage,
};
use maap_worker::{McpManager, ServiceClient};
use serde_json::json;
use test_log::test;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx() -> ActivityContext {
    ActivityContext::new(Uuid::now_v7(), Uuid::now_v7(), "step-1", 1, 3)
}

fn client() -> ServiceClient {
    ServiceClient::with_timeout(Duration::from_secs(5)).unwrap()
}

fn invocation() -> ModelInvocation {
    ModelInvocation {
        prompt: "Describe a cat".into(),
        model_id: Some("claude".into()),
        parameters: json!({ "max_tokens": 64 }),
    }
}

#[test(tokio::test)]
async fn test_model_invocation_returns_service_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invoke"))
        .and(body_partial_json(json!({ "prompt": "Describe a cat", "model_id": "claude" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "purr" })))
        .expect(1)
        .mount(&server)
        .await;

    let activity = InvokeBedrock::new(client(), Some(format!("{}/invoke", server.uri())));
    let output = activity.execute(&ctx(), invocation()).await.unwrap();

    assert_eq!(output, json!({ "text": "purr" }));
}

#[test(tokio::test)]
async fn test_service_unavailable_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    let activity = InvokeBedrock::new(client(), Some(server.uri()));
    let err = activity.execute(&ctx(), invocation()).await.unwrap_err();

    assert!(err.retryable);
    assert_eq!(err.error_type.as_deref(), Some("SERVICE_UNAVAILABLE"));
    assert!(err.message.contains("warming up"));
}

#[test(tokio::test)]
async fn test_rejected_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unsupported format"))
        .mount(&server)
        .await;

    let activity = ProcessImage::new(client(), Some(server.uri()));
    let request = ImageRequest {
        image_url: "s3://bucket/cat.tiff".into(),
        operations: vec!["resize".into()],
    };
    let err = activity.execute(&ctx(), request).await.unwrap_err();

    assert!(!err.retryable);
    assert_eq!(err.error_type.as_deref(), Some("SERVICE_REJECTED"));
}

#[test(tokio::test)]
async fn test_refused_connection_is_retryable() {
    // Bind and drop a listener to get a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let activity = InvokeBedrock::new(client(), Some(format!("http://127.0.0.1:{port}/invoke")));
    let err = activity.execute(&ctx(), invocation()).await.unwrap_err();

    assert!(err.retryable);
    assert_eq!(err.error_type.as_deref(), Some("TRANSPORT"));
}

#[test(tokio::test)]
async fn test_cancellation_interrupts_slow_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ingested": 1 }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let activity = IngestData::new(client(), Some(server.uri()));
    let ctx = ctx();
    let handle = ctx.cancellation_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let request = IngestRequest {
        source: "crm".into(),
        documents: vec![json!({ "id": 1 })],
        metadata: json!({}),
    };
    let started = std::time::Instant::now();
    let err = activity.execute(&ctx, request).await.unwrap_err();

    assert_eq!(err.error_type.as_deref(), Some("CANCELLED"));
    assert!(!err.retryable);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test(tokio::test)]
async fn test_tool_call_goes_through_shared_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": {} }))
                .insert_header("Mcp-Session-Id", "s-42"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "notifications/initialized" })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": { "name": "semantic_cache_check" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": { "content": [{ "type": "text", "text": "miss" }] }
        })))
        .mount(&server)
        .await;

    let mcp = Arc::new(
        McpManager::new(&[McpServerConfig {
            name: "ai-memory".into(),
            url: server.uri(),
        }])
        .unwrap(),
    );
    let activity = McpCallTool::new(mcp.clone());

    for _ in 0..2 {
        let call = McpToolCall {
            server: "ai-memory".into(),
            tool: "semantic_cache_check".into(),
            arguments: json!({ "query": "cats" }),
        };
        let output = activity.execute(&ctx(), call).await.unwrap();
        assert_eq!(output["content"][0]["text"], "miss");
    }

    assert_eq!(mcp.open_sessions(), 1);
    server.verify().await;
}

#[test(tokio::test)]
async fn test_unknown_mcp_server_is_not_retried() {
    let mcp = Arc::new(McpManager::new(&[]).unwrap());
    let activity = McpCallTool::new(mcp);

    let call = McpToolCall {
        server: "nowhere".into(),
        tool: "store_memory".into(),
        arguments: json!({}),
    };
    let err = activity.execute(&ctx(), call).await.unwrap_err();

    assert!(!err.retryable);
    assert_eq!(err.error_type.as_deref(), Some("MCP_ERROR"));
}
