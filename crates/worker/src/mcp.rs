// MCP connection manager
//
// Holds client sessions to the configured MCP servers over the streamable
// HTTP transport (JSON-RPC 2.0 POSTs, session id carried in the
// `Mcp-Session-Id` header).
//
// Decision: sessions are opened lazily on first use and only closed by
// `shutdown()`, which the worker lifecycle calls exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use maap_core::{McpServerConfig, WorkerSettings};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::lifecycle::ResourceManager;

/// Session header of the streamable HTTP transport
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Protocol revision announced in `initialize`
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("unknown MCP server: {0}")]
    UnknownServer(String),

    #[error("MCP manager is shut down")]
    Closed,

    #[error("invalid URL for MCP server {name}: {source}")]
    InvalidUrl {
        name: String,
        #[source]
        source: url::ParseError,
    },

    #[error("MCP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MCP server {server} returned HTTP {status}: {message}")]
    Status {
        server: String,
        status: u16,
        message: String,
    },

    #[error("MCP server {server} returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("invalid response from MCP server {server}: {message}")]
    InvalidResponse { server: String, message: String },
}

impl McpError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug)]
struct Session {
    id: Option<String>,
}

struct Server {
    url: Url,
    session: OnceCell<Session>,
}

/// Client sessions to the configured MCP servers
pub struct McpManager {
    http: reqwest::Client,
    servers: HashMap<String, Server>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl McpManager {
    pub fn new(servers: &[McpServerConfig]) -> Result<Self, McpError> {
        Self::with_timeout(servers, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(servers: &[McpServerConfig], timeout: Duration) -> Result<Self, McpError> {
        let servers = servers
            .iter()
            .map(|config| {
                let url = Url::parse(&config.url).map_err(|source| McpError::InvalidUrl {
                    name: config.name.clone(),
                    source,
                })?;
                Ok((
                    config.name.clone(),
                    Server {
                        url,
                        session: OnceCell::new(),
                    },
                ))
            })
            .collect::<Result<HashMap<_, _>, McpError>>()?;

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            servers,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_settings(settings: &WorkerSettings) -> Result<Self, McpError> {
        Self::new(&settings.mcp_servers)
    }

    /// Configured server names, sorted
    pub fn server_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.servers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of sessions opened so far
    pub fn open_sessions(&self) -> usize {
        self.servers
            .values()
            .filter(|s| s.session.initialized())
            .count()
    }

    /// `tools/call`
    pub async fn call_tool(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request(server, "tools/call", params).await
    }

    /// `resources/read`
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value, McpError> {
        self.request(server, "resources/read", json!({ "uri": uri })).await
    }

    /// `prompts/get`
    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request(server, "prompts/get", params).await
    }

    async fn request(
        &self,
        server_name: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, McpError> {
        let server = self.server(server_name)?;
        let session = server
            .session
            .get_or_try_init(|| self.initialize(server_name, server))
            .await?;

        if self.is_closed() {
            return Err(McpError::Closed);
        }

        self.rpc(server_name, server, session.id.as_deref(), method, params)
            .await
            .map(|(result, _)| result)
    }

    fn server(&self, name: &str) -> Result<&Server, McpError> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        self.servers
            .get(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))
    }

    async fn initialize(&self, name: &str, server: &Server) -> Result<Session, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "maap-worker",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let (_, session_id) = self.rpc(name, server, None, "initialize", params).await?;

        let mut notification = self
            .http
            .post(server.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }));
        if let Some(id) = &session_id {
            notification = notification.header(SESSION_HEADER, id);
        }
        let response = notification.send().await?;
        if !response.status().is_success() {
            return Err(status_error(name, response).await);
        }

        info!(server = name, session_id = ?session_id, "MCP session opened");
        Ok(Session { id: session_id })
    }

    /// Send one JSON-RPC request; returns the result and any session id the server assigned
    async fn rpc(
        &self,
        name: &str,
        server: &Server,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<(Value, Option<String>), McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(server = name, method, id, "MCP request");

        let mut request = self
            .http
            .post(server.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
        if let Some(session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(name, response).await);
        }

        let assigned = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let parsed = if is_stream {
            read_event_stream(name, response, id).await?
        } else {
            let body = response.text().await?;
            serde_json::from_str(&body).map_err(|e| invalid(name, e.to_string()))?
        };

        if let Some(error) = parsed.error {
            return Err(McpError::Rpc {
                server: name.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        let result = parsed
            .result
            .ok_or_else(|| invalid(name, "response has neither result nor error"))?;
        Ok((result, assigned))
    }

    async fn close_session(
        &self,
        name: &str,
        server: &Server,
        session_id: &str,
    ) -> Result<(), McpError> {
        let response = self
            .http
            .delete(server.url.clone())
            .header(SESSION_HEADER, session_id)
            .send()
            .await?;

        // Servers that do not support explicit termination answer 405
        if response.status().is_success() || response.status() == StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(status_error(name, response).await)
        }
    }
}

#[async_trait]
impl ResourceManager for McpManager {
    fn name(&self) -> &str {
        "mcp"
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("MCP manager already shut down");
            return;
        }

        for (name, server) in &self.servers {
            let Some(session_id) = server.session.get().and_then(|s| s.id.as_deref()) else {
                continue;
            };

            match self.close_session(name, server, session_id).await {
                Ok(()) => info!(server = %name, "MCP session closed"),
                Err(e) => warn!(server = %name, error = %e, "Failed to close MCP session"),
            }
        }
    }
}

fn invalid(server: &str, message: impl Into<String>) -> McpError {
    McpError::InvalidResponse {
        server: server.to_string(),
        message: message.into(),
    }
}

async fn status_error(server: &str, response: reqwest::Response) -> McpError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    McpError::Status {
        server: server.to_string(),
        status,
        message,
    }
}

/// Read SSE events until the response to request `id` arrives
///
/// Notifications and server requests may precede it on the same stream.
async fn read_event_stream(
    server: &str,
    response: reqwest::Response,
    id: u64,
) -> Result<RpcResponse, McpError> {
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| invalid(server, e.to_string()))?;
        if event.data.trim().is_empty() {
            continue;
        }

        let message: RpcResponse =
            serde_json::from_str(&event.data).map_err(|e| invalid(server, e.to_string()))?;
        if is_response_to(&message, id) {
            return Ok(message);
        }
        debug!(server, "skipping unrelated MCP message");
    }

    Err(invalid(server, "event stream ended without a response"))
}

fn is_response_to(message: &RpcResponse, id: u64) -> bool {
    let answered = message.result.is_some() || message.error.is_some();
    let matches = match &message.id {
        Some(Value::Number(n)) => n.as_u64() == Some(id),
        Some(Value::String(s)) => s.parse::<u64>().ok() == Some(id),
        _ => true,
    };
    answered && matches
}
