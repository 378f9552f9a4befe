// Worker Configuration
//
// Settings for a MAAP worker process, loaded from environment variables.
// A `.env` file in the working directory is honored when present.

use std::env;
use std::time::Duration;

use uuid::Uuid;

/// Default execution pool capacity for activity invocations
pub const DEFAULT_MAX_CONCURRENT_ACTIVITIES: usize = 100;

/// Errors raised while loading or validating settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A semantic constraint does not hold
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// One MCP server the worker may open a session with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    /// Logical server name used by activities
    pub name: String,
    /// Streamable HTTP endpoint of the server
    pub url: String,
}

/// Configuration for a worker process
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Application name, used as service name for logs and traces
    pub app_name: String,
    /// Unique identifier of this worker instance
    pub worker_id: String,

    /// Orchestration backend host
    pub backend_host: String,
    /// Orchestration backend port
    pub backend_port: u16,
    /// Backend database name
    pub backend_database: String,
    /// Backend user (optional, falls back to driver defaults)
    pub backend_user: Option<String>,
    /// Backend password
    pub backend_password: Option<String>,
    /// Timeout for establishing the backend connection
    pub connect_timeout: Duration,

    /// Task queue this worker serves
    pub task_queue: String,
    /// Maximum simultaneous activity executions
    pub max_concurrent_activities: usize,
    /// How long shutdown waits for in-flight activities
    pub shutdown_timeout: Duration,

    /// Remote logging service endpoint
    pub logger_service_url: Option<String>,

    /// MCP servers reachable from MCP activities
    pub mcp_servers: Vec<McpServerConfig>,
    /// Model invocation service endpoint
    pub model_service_url: Option<String>,
    /// Image processing service endpoint
    pub image_service_url: Option<String>,
    /// Data ingestion service endpoint
    pub ingest_service_url: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            app_name: "maap-worker".to_string(),
            worker_id: format!("worker-{}", Uuid::now_v7()),
            backend_host: "localhost".to_string(),
            backend_port: 5432,
            backend_database: "maap".to_string(),
            backend_user: None,
            backend_password: None,
            connect_timeout: Duration::from_secs(10),
            task_queue: "maap-task-queue".to_string(),
            max_concurrent_activities: DEFAULT_MAX_CONCURRENT_ACTIVITIES,
            shutdown_timeout: Duration::from_secs(30),
            logger_service_url: None,
            mcp_servers: vec![],
            model_service_url: None,
            image_service_url: None,
            ingest_service_url: None,
        }
    }
}

impl WorkerSettings {
    /// Create settings from environment variables
    ///
    /// Environment variables:
    /// - `APP_NAME`: Application name (default: "maap-worker")
    /// - `WORKER_ID`: Worker identity (default: generated)
    /// - `BACKEND_HOST` / `BACKEND_PORT`: Orchestration backend address (default: localhost:5432)
    /// - `BACKEND_DATABASE`, `BACKEND_USER`, `BACKEND_PASSWORD`: Backend credentials
    /// - `BACKEND_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
    /// - `TASK_QUEUE`: Task queue name (default: "maap-task-queue")
    /// - `MAX_CONCURRENT_ACTIVITIES`: Execution pool capacity (default: 100)
    /// - `SHUTDOWN_TIMEOUT_SECS`: Drain timeout for in-flight activities (default: 30)
    /// - `LOGGER_SERVICE_URL`: Remote logging service
    /// - `MCP_SERVERS`: Comma-separated `name=url` pairs
    /// - `MODEL_SERVICE_URL`, `IMAGE_SERVICE_URL`, `INGEST_SERVICE_URL`: Activity services
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let settings = Self {
            app_name: var("APP_NAME").unwrap_or(defaults.app_name),
            worker_id: var("WORKER_ID").unwrap_or(defaults.worker_id),
            backend_host: var("BACKEND_HOST").unwrap_or(defaults.backend_host),
            backend_port: parse_or("BACKEND_PORT", var("BACKEND_PORT"), defaults.backend_port)?,
            backend_database: var("BACKEND_DATABASE").unwrap_or(defaults.backend_database),
            backend_user: var("BACKEND_USER"),
            backend_password: var("BACKEND_PASSWORD"),
            connect_timeout: Duration::from_secs(parse_or(
                "BACKEND_CONNECT_TIMEOUT_SECS",
                var("BACKEND_CONNECT_TIMEOUT_SECS"),
                defaults.connect_timeout.as_secs(),
            )?),
            task_queue: var("TASK_QUEUE").unwrap_or(defaults.task_queue),
            max_concurrent_activities: parse_or(
                "MAX_CONCURRENT_ACTIVITIES",
                var("MAX_CONCURRENT_ACTIVITIES"),
                defaults.max_concurrent_activities,
            )?,
            shutdown_timeout: Duration::from_secs(parse_or(
                "SHUTDOWN_TIMEOUT_SECS",
                var("SHUTDOWN_TIMEOUT_SECS"),
                defaults.shutdown_timeout.as_secs(),
            )?),
            logger_service_url: var("LOGGER_SERVICE_URL"),
            mcp_servers: match var("MCP_SERVERS") {
                Some(raw) => parse_mcp_servers(&raw)?,
                None => vec![],
            },
            model_service_url: var("MODEL_SERVICE_URL"),
            image_service_url: var("IMAGE_SERVICE_URL"),
            ingest_service_url: var("INGEST_SERVICE_URL"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_queue.trim().is_empty() {
            return Err(ConfigError::Validation("task queue must not be empty".into()));
        }
        if self.backend_port == 0 {
            return Err(ConfigError::Validation("backend port must not be 0".into()));
        }
        if self.max_concurrent_activities == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_activities must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Backend address as `host:port`
    pub fn backend_address(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// Look up an MCP server by name
    pub fn mcp_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_mcp_servers(raw: &str) -> Result<Vec<McpServerConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry
                .split_once('=')
                .map(|(n, u)| (n.trim(), u.trim()))
                .filter(|(n, u)| !n.is_empty() && !u.is_empty())
                .ok_or_else(|| ConfigError::Invalid {
                    key: "MCP_SERVERS",
                    value: entry.to_string(),
                    reason: "expected name=url".to_string(),
                })?;
            Ok(McpServerConfig {
                name: name.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}
