use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use run_telemetry::config::{CliArgs, ServerConfig, SERVICE_NAME};
use run_telemetry::server;
use run_telemetry::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_args(CliArgs::parse());

    // Initialize tracing; the guard flushes the file writer on exit
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "run-telemetry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "run_telemetry=info,tower_http=info".into()),
        )
        .with(fmt::layer())
        .with(file_layer)
        .init();

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!("Database: {:?}", config.db_path);
    if config.api_key.is_none() {
        warn!("METRICS_API_KEY is not set; protected routes will answer 500");
    }

    let state = Arc::new(AppState::from_config(&config)?);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    server::serve(listener, state, shutdown_signal()).await?;

    info!("Metrics server shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
