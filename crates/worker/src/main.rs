use std::sync::Arc;

use anyhow::{Context, Result};
use maap_core::telemetry::{init_telemetry, TelemetryConfig};
use maap_core::{Logger, LoggerConfig, WorkerSettings};
use maap_durable::backend::PostgresConnector;
use maap_worker::{
    handler_registry, LifecycleOutcome, McpManager, ServiceClient, WorkerLifecycle,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "maap-worker")
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: info for the maap crates)
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("maap=info,maap_worker=info,maap_durable=info".to_string());
    }

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let settings = WorkerSettings::from_env().context("Failed to load worker settings")?;
    let logger = Logger::global(&LoggerConfig::new(
        settings.app_name.clone(),
        settings.logger_service_url.clone(),
    ));

    tracing::info!(
        worker_id = %settings.worker_id,
        task_queue = %settings.task_queue,
        backend = %settings.backend_address(),
        logger = logger.sink_name(),
        "maap-worker starting..."
    );

    let connector = Arc::new(
        PostgresConnector::new(settings.backend_database.clone())
            .with_credentials(settings.backend_user.clone(), settings.backend_password.clone())
            .with_connect_timeout(settings.connect_timeout),
    );
    let mcp = Arc::new(
        McpManager::from_settings(&settings).context("Failed to configure MCP servers")?,
    );
    let client = ServiceClient::new().context("Failed to build service HTTP client")?;

    let registrar = {
        let settings = settings.clone();
        let mcp = mcp.clone();
        move || handler_registry(&settings, mcp, client)
    };

    let lifecycle = WorkerLifecycle::new(settings, connector, registrar, mcp, logger);

    match lifecycle.run(shutdown_signal()).await {
        LifecycleOutcome::Stopped => tracing::info!("Worker stopped"),
        LifecycleOutcome::Cancelled => tracing::info!("Worker shutdown complete"),
        // Already logged with full detail by the lifecycle
        LifecycleOutcome::Failed { .. } => tracing::info!("Worker exited after failure"),
    }

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
