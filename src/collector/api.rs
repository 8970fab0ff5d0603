use chrono::Utc;

use super::{describe_error, RunClock, RunInfo, RunPhase};
use crate::metrics::{
    ApiCallMetric, ApiDetails, ApiErrorDetail, ApiTestError, ApiTestMetrics, Metadata, RunStatus,
    SchemaValidationMetric,
};

/// Accumulates API calls and schema checks for one test run.
#[derive(Debug, Default)]
pub struct ApiMetricsCollector {
    clock: RunClock,
    api_calls: Vec<ApiCallMetric>,
    schema_validations: Vec<SchemaValidationMetric>,
    error: Option<ApiTestError>,
}

impl ApiMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a fresh run, discarding anything recorded earlier.
    pub fn start(&mut self) {
        self.api_calls.clear();
        self.schema_validations.clear();
        self.error = None;
        self.clock.start();
    }

    pub fn phase(&self) -> RunPhase {
        self.clock.phase()
    }

    pub fn record_api_call(&mut self, call: ApiCallMetric) {
        if self.clock.accepts("API call") {
            self.api_calls.push(call);
        }
    }

    pub fn record_schema_validation(
        &mut self,
        schema: impl Into<String>,
        valid: bool,
        validation_time: f64,
    ) {
        if self.clock.accepts("schema validation") {
            self.schema_validations.push(SchemaValidationMetric {
                schema: schema.into(),
                valid,
                validation_time,
            });
        }
    }

    /// Record the failure that ended the run. A later error replaces an
    /// earlier one.
    pub fn record_error(
        &mut self,
        err: &(dyn std::error::Error + 'static),
        api_error: Option<ApiErrorDetail>,
    ) {
        let (message, stack) = describe_error(err);
        self.record_error_detail(ApiTestError {
            message,
            stack,
            api_error,
        });
    }

    pub fn record_error_detail(&mut self, error: ApiTestError) {
        if self.clock.accepts("error") {
            self.error = Some(error);
        }
    }

    pub fn api_call_count(&self) -> usize {
        self.api_calls.len()
    }

    /// Sum of recorded response times in milliseconds, unrounded.
    pub fn total_api_time(&self) -> f64 {
        self.api_calls.iter().map(|c| c.response_time).sum()
    }

    /// Assemble the summary record. Recording stays open afterwards, so a
    /// second call reflects everything recorded so far.
    pub fn build(&mut self, info: &RunInfo, metadata: Option<Metadata>) -> ApiTestMetrics {
        let duration = self.clock.finish();
        ApiTestMetrics {
            test_id: info.test_id.clone(),
            test_name: info.title.clone(),
            suite_name: info.suite_name(),
            timestamp: Utc::now(),
            environment: info.environment,
            status: RunStatus::from_signal(&info.status),
            duration,
            retry_count: u64::from(info.retry),
            details: ApiDetails::new(
                self.api_calls.clone(),
                self.schema_validations.clone(),
                self.error.clone(),
            ),
            metadata,
        }
    }
}
