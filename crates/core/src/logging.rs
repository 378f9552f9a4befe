// Logger capability
//
// A small logging facade handed to long-running components. It is selected
// once per process: the remote logging service when it can be reached by
// configuration, otherwise a console sink with a fixed format. Both tiers
// also emit `tracing` events so local output is never lost.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

/// Capacity of the background shipping queue of the remote sink
const REMOTE_QUEUE_CAPACITY: usize = 1024;

/// Severity of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A single log record as shipped to a sink
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub app_name: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, app_name: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            app_name: app_name.to_string(),
            message: message.into(),
        }
    }

    /// Fixed single-line format used by the console tier
    pub fn format_line(&self) -> String {
        format!(
            "{} - {} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S,%3f"),
            self.app_name,
            self.level,
            self.message
        )
    }
}

/// Destination for log records
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Short name of the sink, for diagnostics
    fn name(&self) -> &'static str;

    /// Record without waiting for delivery
    fn emit(&self, record: LogRecord);

    /// Record and wait until the sink has accepted it
    async fn deliver(&self, record: LogRecord);
}

fn trace_record(record: &LogRecord) {
    match record.level {
        LogLevel::Info => tracing::info!(target: "maap", app = %record.app_name, "{}", record.message),
        LogLevel::Error => {
            tracing::error!(target: "maap", app = %record.app_name, "{}", record.message)
        }
    }
}

/// Console fallback tier
///
/// Writes through the tracing subscriber when one is installed, and falls
/// back to the fixed line format on stdout when none is.
#[derive(Debug, Default, Clone)]
pub struct ConsoleLogSink;

#[async_trait]
impl LogSink for ConsoleLogSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn emit(&self, record: LogRecord) {
        if tracing::dispatcher::has_been_set() {
            trace_record(&record);
        } else {
            println!("{}", record.format_line());
        }
    }

    async fn deliver(&self, record: LogRecord) {
        self.emit(record);
    }
}

/// Errors building the remote tier
#[derive(Debug, thiserror::Error)]
pub enum RemoteSinkError {
    #[error("logger service URL is not configured")]
    NotConfigured,

    #[error("invalid logger service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("no async runtime available for log shipping")]
    NoRuntime,
}

/// Remote logging service tier
///
/// Records are POSTed as JSON to the configured endpoint. `emit` queues the
/// record for a background shipper; `deliver` posts inline.
pub struct RemoteLogSink {
    client: reqwest::Client,
    endpoint: Url,
    tx: mpsc::Sender<LogRecord>,
}

impl RemoteLogSink {
    /// Build the sink and start its background shipper
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RemoteSinkError> {
        let endpoint = Url::parse(endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteSinkError::NoRuntime)?;

        let (tx, mut rx) = mpsc::channel::<LogRecord>(REMOTE_QUEUE_CAPACITY);
        let shipper_client = client.clone();
        let shipper_endpoint = endpoint.clone();
        runtime.spawn(async move {
            while let Some(record) = rx.recv().await {
                post_record(&shipper_client, &shipper_endpoint, &record).await;
            }
        });

        Ok(Self {
            client,
            endpoint,
            tx,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

async fn post_record(client: &reqwest::Client, endpoint: &Url, record: &LogRecord) {
    let result = client
        .post(endpoint.clone())
        .json(record)
        .send()
        .await
        .and_then(|r| r.error_for_status());

    if let Err(e) = result {
        tracing::warn!(error = %e, endpoint = %endpoint, "Failed to ship log record");
    }
}

#[async_trait]
impl LogSink for RemoteLogSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn emit(&self, record: LogRecord) {
        trace_record(&record);
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!(error = %e, "Log shipping queue unavailable, record kept local only");
        }
    }

    async fn deliver(&self, record: LogRecord) {
        trace_record(&record);
        post_record(&self.client, &self.endpoint, &record).await;
    }
}

/// Logger selection inputs
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Application name attached to every record
    pub app_name: String,
    /// Remote logging service endpoint
    pub service_url: Option<String>,
    /// Per-request timeout for the remote tier
    pub timeout: Duration,
}

impl LoggerConfig {
    pub fn new(app_name: impl Into<String>, service_url: Option<String>) -> Self {
        Self {
            app_name: app_name.into(),
            service_url,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Logging capability injected into components
///
/// Cheap to clone; all clones share one sink.
#[derive(Clone)]
pub struct Logger {
    app_name: Arc<str>,
    sink: Arc<dyn LogSink>,
}

static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

impl Logger {
    /// Create a logger over an explicit sink
    pub fn new(app_name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        let app_name: String = app_name.into();
        Self {
            app_name: app_name.into(),
            sink,
        }
    }

    /// Console-only logger
    pub fn console(app_name: impl Into<String>) -> Self {
        Self::new(app_name, Arc::new(ConsoleLogSink))
    }

    /// Select the richest available tier for the configuration
    ///
    /// Tries the remote tier; any failure to construct it falls back to the
    /// console tier.
    pub fn from_config(config: &LoggerConfig) -> Self {
        let remote = config
            .service_url
            .as_deref()
            .ok_or(RemoteSinkError::NotConfigured)
            .and_then(|url| RemoteLogSink::new(url, config.timeout));

        match remote {
            Ok(sink) => Self::new(config.app_name.clone(), Arc::new(sink)),
            Err(e) => {
                tracing::debug!(reason = %e, "Remote logger unavailable, using console logger");
                Self::console(config.app_name.clone())
            }
        }
    }

    /// Process-wide logger, selected on first call and cached afterwards
    ///
    /// Later calls return the cached logger regardless of `config`.
    pub fn global(config: &LoggerConfig) -> Logger {
        GLOBAL_LOGGER
            .get_or_init(|| Self::from_config(config))
            .clone()
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Name of the selected sink tier
    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.sink
            .emit(LogRecord::new(LogLevel::Info, &self.app_name, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.sink
            .emit(LogRecord::new(LogLevel::Error, &self.app_name, message));
    }

    /// Info record that waits for the sink to accept it
    pub async fn ainfo(&self, message: impl Into<String>) {
        self.sink
            .deliver(LogRecord::new(LogLevel::Info, &self.app_name, message))
            .await;
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("app_name", &self.app_name)
            .field("sink", &self.sink.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_format_line() {
        let record = LogRecord::new(LogLevel::Error, "maap", "boom");
        let line = record.format_line();
        assert!(line.ends_with(" - maap - ERROR - boom"));
    }

    #[test]
    fn test_falls_back_without_url() {
        let logger = Logger::from_config(&LoggerConfig::new("maap", None));
        assert_eq!(logger.sink_name(), "console");
        assert_eq!(logger.app_name(), "maap");
    }

    #[tokio::test]
    async fn test_falls_back_on_invalid_url() {
        let logger = Logger::from_config(&LoggerConfig::new("maap", Some("not a url".into())));
        assert_eq!(logger.sink_name(), "console");
    }

    #[test]
    fn test_falls_back_outside_runtime() {
        let logger = Logger::from_config(&LoggerConfig::new(
            "maap",
            Some("http://localhost:9/logs".into()),
        ));
        assert_eq!(logger.sink_name(), "console");
    }

    #[tokio::test]
    async fn test_remote_tier_ships_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs"))
            .and(body_partial_json(serde_json::json!({
                "level": "INFO",
                "app_name": "maap",
                "message": "worker starting"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let logger = Logger::from_config(&LoggerConfig::new(
            "maap",
            Some(format!("{}/logs", server.uri())),
        ));
        assert_eq!(logger.sink_name(), "remote");

        logger.ainfo("worker starting").await;
        server.verify().await;
    }
}
