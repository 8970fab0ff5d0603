//! Fire-and-forget delivery of summary records to the ingestion server.

use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{API_KEY_ENV, DEFAULT_DELIVERY_TIMEOUT_MS, ENDPOINT_ENV, TIMEOUT_ENV};
use crate::metrics::{ApiTestMetrics, E2eTestMetrics, RunDetails, TestRunMetrics};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            api_key: Some(api_key.into()),
            timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read `METRICS_ENDPOINT`, `METRICS_API_KEY` and `METRICS_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let timeout_ms = match var(TIMEOUT_ENV) {
            Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
                warn!(
                    "Ignoring invalid {}={:?}, using {}ms",
                    TIMEOUT_ENV, raw, DEFAULT_DELIVERY_TIMEOUT_MS
                );
                DEFAULT_DELIVERY_TIMEOUT_MS
            }),
            None => DEFAULT_DELIVERY_TIMEOUT_MS,
        };

        Self {
            endpoint: var(ENDPOINT_ENV),
            api_key: var(API_KEY_ENV),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

/// Result of one delivery attempt. Informational only: delivery never
/// fails the calling test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Transport not configured; nothing was sent.
    Disabled,
    Delivered,
    /// The server answered with a non-2xx status.
    Rejected { status: u16, body: String },
    /// Network error or timeout.
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

#[derive(Debug)]
struct Target {
    endpoint: Url,
    api_key: String,
}

#[derive(Debug)]
pub struct MetricsClient {
    http: reqwest::Client,
    target: Option<Target>,
}

impl MetricsClient {
    pub fn new(config: TransportConfig) -> Self {
        let target = match (config.endpoint, config.api_key) {
            (Some(endpoint), Some(api_key)) if !api_key.is_empty() => match parse_endpoint(&endpoint)
            {
                Some(endpoint) => Some(Target { endpoint, api_key }),
                None => {
                    warn!("Invalid metrics endpoint {:?}; metrics upload disabled", endpoint);
                    None
                }
            },
            _ => {
                warn!(
                    "{} or {} not set; metrics upload disabled",
                    ENDPOINT_ENV, API_KEY_ENV
                );
                None
            }
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}", e);
                reqwest::Client::new()
            });

        Self { http, target }
    }

    pub fn from_env() -> Self {
        Self::new(TransportConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// POST one record to the collection matching its flavor. Single
    /// attempt, no retry.
    pub async fn send<D: RunDetails>(&self, record: &TestRunMetrics<D>) -> DeliveryOutcome {
        let label = D::FLAVOR.label();
        let Some(target) = &self.target else {
            debug!("Metrics upload disabled, skipping {} metrics", label);
            return DeliveryOutcome::Disabled;
        };

        let url = format!(
            "{}/api/metrics/{}",
            target.endpoint.as_str().trim_end_matches('/'),
            D::FLAVOR.collection()
        );
        info!("Sending {} metrics for {} to {}", label, record.test_name, url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&target.api_key)
            .json(record)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!("{} metrics delivered ({})", label, resp.status());
                DeliveryOutcome::Delivered
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                error!("Failed to send {} metrics ({}): {}", label, status, body);
                DeliveryOutcome::Rejected { status, body }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timed out: {}", e)
                } else {
                    e.to_string()
                };
                error!("Error sending {} metrics: {}", label, reason);
                DeliveryOutcome::Failed { reason }
            }
        }
    }

    pub async fn push_api_metrics(&self, record: &ApiTestMetrics) -> DeliveryOutcome {
        self.send(record).await
    }

    pub async fn push_e2e_metrics(&self, record: &E2eTestMetrics) -> DeliveryOutcome {
        self.send(record).await
    }
}

fn parse_endpoint(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}
