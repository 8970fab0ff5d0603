use std::sync::Arc;

use crate::config::ServerConfig;
use crate::metrics::db::MetricsDb;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub db: Arc<MetricsDb>,
    /// Expected bearer token; `None` means the server is misconfigured.
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(db: MetricsDb, api_key: Option<String>) -> Self {
        Self {
            db: Arc::new(db),
            api_key,
        }
    }

    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let db = MetricsDb::open(&config.db_path)?;
        Ok(Self::new(db, config.api_key.clone()))
    }

    /// Run a blocking storage call off the async runtime.
    pub async fn with_db<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&MetricsDb) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}
