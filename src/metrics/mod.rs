pub mod db;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Free-form metadata attached to a run.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Flavor
// ============================================================================

/// The two telemetry shapes sharing one ingestion/storage pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    Api,
    E2e,
}

impl Flavor {
    /// Path segment under `/api/metrics/`.
    pub fn collection(self) -> &'static str {
        match self {
            Flavor::Api => "api-tests",
            Flavor::E2e => "e2e-tests",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Flavor::Api => "api_test_metrics",
            Flavor::E2e => "e2e_test_metrics",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Flavor::Api => "API",
            Flavor::E2e => "E2E",
        }
    }
}

/// Binds a flavor-specific payload to its flavor.
pub trait RunDetails:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    const FLAVOR: Flavor;

    /// Extra fields echoed back when a record of this flavor is accepted.
    fn receipt_fields(&self) -> Metadata {
        Metadata::new()
    }

    /// Status as stored for this flavor.
    fn normalize_status(status: RunStatus) -> RunStatus {
        status
    }
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "String")]
pub enum RunStatus {
    Passed,
    #[default]
    Failed,
    Skipped,
    TimedOut,
    Flaky,
}

impl RunStatus {
    /// Map a test runner's outcome signal. The runner never reports `flaky`,
    /// and anything unrecognised counts as a failure.
    pub fn from_signal(signal: &str) -> Self {
        match signal {
            "passed" => RunStatus::Passed,
            "skipped" => RunStatus::Skipped,
            "timedOut" => RunStatus::TimedOut,
            _ => RunStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::TimedOut => "timedOut",
            RunStatus::Flaky => "flaky",
        }
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "flaky" => RunStatus::Flaky,
            other => RunStatus::from_signal(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Environment {
    #[default]
    Local,
    Ci,
}

impl Environment {
    /// `ci` whenever a non-empty `CI` variable is set.
    pub fn detect() -> Self {
        match std::env::var("CI") {
            Ok(value) if !value.is_empty() => Environment::Ci,
            _ => Environment::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Ci => "ci",
        }
    }
}

impl From<String> for Environment {
    fn from(value: String) -> Self {
        if value == "ci" {
            Environment::Ci
        } else {
            Environment::Local
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    /// Derive the engine from a project or browser name; chromium unless the
    /// name mentions firefox or webkit.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("firefox") {
            Browser::Firefox
        } else if lower.contains("webkit") {
            Browser::Webkit
        } else {
            Browser::Chromium
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl From<String> for Browser {
    fn from(value: String) -> Self {
        Browser::from_name(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
    Navigate,
    Wait,
    Scroll,
    Select,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallMetric {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    /// Milliseconds.
    pub response_time: f64,
    #[serde(default)]
    pub request_size: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset: Option<u64>,
}

impl ApiCallMetric {
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status_code: u16,
        response_time: f64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            response_time,
            request_size: 0,
            response_size: 0,
            headers: HashMap::new(),
            rate_limit_remaining: None,
            rate_limit_reset: None,
        }
    }

    pub fn with_sizes(mut self, request_size: u64, response_size: u64) -> Self {
        self.request_size = request_size;
        self.response_size = response_size;
        self
    }

    /// Attach the selected response headers, lifting the rate-limit pair out
    /// of them when present.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.trim().parse::<u64>().ok())
        };
        self.rate_limit_remaining = lookup("x-ratelimit-remaining");
        self.rate_limit_reset = lookup("x-ratelimit-reset");
        self.headers = headers;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaValidationMetric {
    pub schema: String,
    pub valid: bool,
    pub validation_time: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageMetric {
    pub url: String,
    pub load_time: f64,
    pub dom_content_loaded: f64,
    pub first_contentful_paint: f64,
    pub time_to_interactive: f64,
    pub total_size: u64,
    pub request_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetric {
    pub action: ActionKind,
    pub selector: String,
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserMetric {
    /// Megabytes of JS heap in use.
    pub memory_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkMetric {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_transferred: u64,
    pub resource_types: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisualMetric {
    pub screenshots_taken: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_diff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_comparisons: Option<u32>,
}

// ============================================================================
// Error details
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorDetail {
    pub endpoint: String,
    pub status_code: u16,
    pub error_body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTestError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eTestError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

// ============================================================================
// Flavor payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowestCall {
    pub endpoint: String,
    pub duration: u64,
}

/// API-flavor payload. The aggregates are derived from `api_calls` on
/// construction and on every deserialization; they cannot be set directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ApiDetailsWire")]
pub struct ApiDetails {
    api_calls: Vec<ApiCallMetric>,
    total_api_time: u64,
    average_response_time: u64,
    slowest_call: SlowestCall,
    schema_validations: Vec<SchemaValidationMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiTestError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiDetailsWire {
    #[serde(default)]
    api_calls: Vec<ApiCallMetric>,
    #[serde(default)]
    schema_validations: Option<Vec<SchemaValidationMetric>>,
    #[serde(default)]
    error: Option<ApiTestError>,
}

impl From<ApiDetailsWire> for ApiDetails {
    fn from(wire: ApiDetailsWire) -> Self {
        ApiDetails::new(
            wire.api_calls,
            wire.schema_validations.unwrap_or_default(),
            wire.error,
        )
    }
}

impl ApiDetails {
    pub fn new(
        api_calls: Vec<ApiCallMetric>,
        schema_validations: Vec<SchemaValidationMetric>,
        error: Option<ApiTestError>,
    ) -> Self {
        let total: f64 = api_calls.iter().map(|c| c.response_time).sum();
        let average = if api_calls.is_empty() {
            0.0
        } else {
            total / api_calls.len() as f64
        };

        // Strict comparison keeps the first of several equally slow calls.
        let mut slowest: Option<&ApiCallMetric> = None;
        for call in &api_calls {
            if slowest.map_or(true, |s| call.response_time > s.response_time) {
                slowest = Some(call);
            }
        }
        let slowest_call = slowest
            .map(|c| SlowestCall {
                endpoint: c.endpoint.clone(),
                duration: round_ms(c.response_time),
            })
            .unwrap_or_default();

        Self {
            total_api_time: round_ms(total),
            average_response_time: round_ms(average),
            slowest_call,
            api_calls,
            schema_validations,
            error,
        }
    }

    pub fn api_calls(&self) -> &[ApiCallMetric] {
        &self.api_calls
    }

    pub fn schema_validations(&self) -> &[SchemaValidationMetric] {
        &self.schema_validations
    }

    pub fn total_api_time(&self) -> u64 {
        self.total_api_time
    }

    pub fn average_response_time(&self) -> u64 {
        self.average_response_time
    }

    pub fn slowest_call(&self) -> &SlowestCall {
        &self.slowest_call
    }

    pub fn error(&self) -> Option<&ApiTestError> {
        self.error.as_ref()
    }
}

impl RunDetails for ApiDetails {
    const FLAVOR: Flavor = Flavor::Api;

    /// `flaky` is a browser-run outcome only.
    fn normalize_status(status: RunStatus) -> RunStatus {
        match status {
            RunStatus::Flaky => RunStatus::Failed,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eDetails {
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub page_metrics: Vec<PageMetric>,
    #[serde(default)]
    pub browser_metrics: BrowserMetric,
    #[serde(default)]
    pub action_metrics: Vec<ActionMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_metrics: Option<VisualMetric>,
    #[serde(default)]
    pub network_metrics: NetworkMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<E2eTestError>,
}

impl RunDetails for E2eDetails {
    const FLAVOR: Flavor = Flavor::E2e;

    fn receipt_fields(&self) -> Metadata {
        let mut fields = Metadata::new();
        fields.insert("browser".to_string(), self.browser.as_str().into());
        fields
    }
}

// ============================================================================
// Summary record
// ============================================================================

/// One aggregated telemetry document per test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunMetrics<D> {
    pub test_id: String,
    pub test_name: String,
    #[serde(default)]
    pub suite_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "non_negative_int")]
    pub duration: u64,
    #[serde(default, deserialize_with = "non_negative_int")]
    pub retry_count: u64,
    #[serde(flatten)]
    pub details: D,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

pub type ApiTestMetrics = TestRunMetrics<ApiDetails>;
pub type E2eTestMetrics = TestRunMetrics<E2eDetails>;

/// A persisted record with its server-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMetric<D> {
    pub id: String,
    #[serde(flatten)]
    pub record: TestRunMetrics<D>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorSummary {
    pub count: u64,
    pub rolling_pass_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_api_metrics: u64,
    pub total_e2e_metrics: u64,
    pub latest_api_pass_rate: u32,
    pub latest_e2e_pass_rate: u32,
    pub last_updated: DateTime<Utc>,
}

pub fn round_ms(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        ms.round() as u64
    } else {
        0
    }
}

/// Accept any JSON number (clients report fractional milliseconds) and clamp
/// it to a non-negative integer.
fn non_negative_int<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(round_ms(value))
}
