use clap::Parser;
use std::path::PathBuf;

/// Run telemetry collector: receives per-run test metrics and serves trends.
#[derive(Parser, Debug, Clone)]
#[command(name = "run-telemetry")]
pub struct CliArgs {
    /// HTTP listen port
    #[arg(long = "port", env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// SQLite database file
    #[arg(long = "database", env = "METRICS_DB_PATH")]
    pub database: Option<PathBuf>,

    /// Shared bearer token expected on every protected route
    #[arg(long = "api-key", env = "METRICS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Directory for daily-rotated log files (stdout only when absent)
    #[arg(long = "log-dir", env = "METRICS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// `None` leaves the server running but every protected route answers 500.
    pub api_key: Option<String>,
    pub log_dir: Option<PathBuf>,
}

// Server constants
pub const DEFAULT_PORT: u16 = 3000;
pub const SERVICE_NAME: &str = "test-metrics-server";
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024; // screenshots and traces

// Query constants
pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const ROLLING_WINDOW: usize = 10;

// Transport constants
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;
pub const ENDPOINT_ENV: &str = "METRICS_ENDPOINT";
pub const API_KEY_ENV: &str = "METRICS_API_KEY";
pub const TIMEOUT_ENV: &str = "METRICS_TIMEOUT_MS";

const DB_FILE_NAME: &str = "metrics.db";

impl ServerConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let db_path = args.database.unwrap_or_else(default_db_path);
        let api_key = args.api_key.filter(|key| !key.trim().is_empty());

        ServerConfig {
            port: args.port,
            db_path,
            api_key,
            log_dir: args.log_dir,
        }
    }
}

/// `<local data dir>/run-telemetry/metrics.db`, or the working directory when
/// the platform has no data dir.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("run-telemetry"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DB_FILE_NAME)
}
