// MAAP worker ambient stack
//
// Shared by every MAAP worker binary:
// - Environment-driven configuration (WorkerSettings)
// - Tracing subscriber initialization with optional OTLP export
// - The Logger capability injected into long-running components

pub mod config;
pub mod logging;
pub mod telemetry;

pub use config::{ConfigError, McpServerConfig, WorkerSettings};
pub use logging::{
    ConsoleLogSink, LogLevel, LogRecord, LogSink, Logger, LoggerConfig, RemoteLogSink,
};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
