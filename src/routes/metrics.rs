use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::DEFAULT_PAGE_LIMIT;
use crate::error::ApiError;
use crate::metrics::{Metadata, MetricsSummary, RunDetails, StoredMetric, TestRunMetrics};
use crate::state::SharedState;

const REQUIRED_FIELDS: [&str; 3] = ["testId", "testName", "timestamp"];
const MISSING_FIELDS: &str = "Missing required fields: testId, testName, or timestamp";
const SAVE_FAILED: &str = "Failed to save metrics";
const LIST_FAILED: &str = "Failed to retrieve metrics";
const SUMMARY_FAILED: &str = "Failed to get metrics summary";

// ============================================================================
// Request/Response types
// ============================================================================

/// Raw pagination parameters; parsed leniently so junk falls back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<D> {
    pub success: bool,
    pub count: usize,
    pub metrics: Vec<StoredMetric<D>>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub success: bool,
    pub summary: MetricsSummary,
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /api/metrics/{flavor}-tests`
pub async fn submit_metrics<D: RunDetails>(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Metadata>), ApiError> {
    let flavor = D::FLAVOR;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        error!("Error saving {} metrics: malformed body: {}", flavor.label(), e);
        ApiError::Internal(SAVE_FAILED)
    })?;

    if !has_required_fields(&payload) {
        return Err(ApiError::BadRequest(MISSING_FIELDS.to_string()));
    }

    let record: TestRunMetrics<D> = serde_json::from_value(payload).map_err(|e| {
        error!("Error saving {} metrics: undecodable record: {}", flavor.label(), e);
        ApiError::Internal(SAVE_FAILED)
    })?;

    let stored = state
        .with_db(move |db| db.save(&record))
        .await
        .map_err(|e| {
            error!("Error saving {} metrics: {:#}", flavor.label(), e);
            ApiError::Internal(SAVE_FAILED)
        })?;

    info!(
        "{} metrics saved: {} ({})",
        flavor.label(),
        stored.record.test_name,
        stored.record.status.as_str()
    );

    let mut receipt = Metadata::new();
    receipt.insert("success".into(), true.into());
    receipt.insert(
        "message".into(),
        format!("{} test metrics received", flavor.label()).into(),
    );
    receipt.insert("id".into(), stored.id.into());
    receipt.insert("testId".into(), stored.record.test_id.into());
    receipt.insert("testName".into(), stored.record.test_name.into());
    receipt.insert("status".into(), stored.record.status.as_str().into());
    receipt.extend(stored.record.details.receipt_fields());

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// `GET /api/metrics/{flavor}-tests?limit&offset`
pub async fn list_metrics<D: RunDetails>(
    State(state): State<SharedState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListResponse<D>>, ApiError> {
    let limit = parse_page_param(query.limit.as_deref())
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = parse_page_param(query.offset.as_deref()).unwrap_or(0);

    let metrics = state
        .with_db(move |db| db.list::<D>(limit, offset))
        .await
        .map_err(|e| {
            error!("Error retrieving {} metrics: {:#}", D::FLAVOR.label(), e);
            ApiError::Internal(LIST_FAILED)
        })?;

    Ok(Json(ListResponse {
        success: true,
        count: metrics.len(),
        metrics,
    }))
}

/// `GET /api/metrics/summary`
pub async fn summary(State(state): State<SharedState>) -> Result<Json<SummaryResponse>, ApiError> {
    let summary = state.with_db(|db| db.summary()).await.map_err(|e| {
        error!("Error getting summary: {:#}", e);
        ApiError::Internal(SUMMARY_FAILED)
    })?;

    Ok(Json(SummaryResponse {
        success: true,
        summary,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn has_required_fields(payload: &Value) -> bool {
    REQUIRED_FIELDS
        .iter()
        .all(|field| payload.get(*field).is_some_and(is_truthy))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Leading-integer parse of a query value. Absent, non-numeric, zero and
/// negative values yield `None` so the caller applies its default.
pub fn parse_page_param(raw: Option<&str>) -> Option<u64> {
    let raw = raw?.trim_start();
    let digits = raw.strip_prefix('+').unwrap_or(raw);
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value = digits[..end].parse::<u64>().ok()?;
    (value > 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_param_defaults() {
        assert_eq!(parse_page_param(None), None);
        assert_eq!(parse_page_param(Some("abc")), None);
        assert_eq!(parse_page_param(Some("")), None);
        assert_eq!(parse_page_param(Some("0")), None);
        assert_eq!(parse_page_param(Some("-5")), None);
    }

    #[test]
    fn test_page_param_leading_integer() {
        assert_eq!(parse_page_param(Some("25")), Some(25));
        assert_eq!(parse_page_param(Some("25abc")), Some(25));
        assert_eq!(parse_page_param(Some("  7")), Some(7));
        assert_eq!(parse_page_param(Some("+3")), Some(3));
    }

    #[test]
    fn test_required_fields() {
        let ok = json!({"testId": "a", "testName": "b", "timestamp": "2024-01-01T00:00:00Z"});
        assert!(has_required_fields(&ok));

        let empty_name = json!({"testId": "a", "testName": "", "timestamp": "2024-01-01T00:00:00Z"});
        assert!(!has_required_fields(&empty_name));

        let missing_ts = json!({"testId": "a", "testName": "b"});
        assert!(!has_required_fields(&missing_ts));

        assert!(!has_required_fields(&json!([1, 2, 3])));
    }
}
