use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use super::{describe_error, RunClock, RunInfo, RunPhase};
use crate::metrics::{
    round_ms, ActionKind, ActionMetric, Browser, BrowserMetric, E2eDetails, E2eTestError,
    E2eTestMetrics, Metadata, NetworkMetric, PageMetric, RunStatus, VisualMetric,
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

// ============================================================================
// Page probe
// ============================================================================

/// Read access to the page under test's performance timeline.
///
/// Implementations wrap whatever automation driver the harness uses. Both
/// methods may fail (page closed, script evaluation rejected); the collector
/// degrades to zero values instead of surfacing the error.
pub trait PerformanceProbe {
    fn snapshot(&self) -> anyhow::Result<PerformanceSnapshot>;

    /// Bytes of JS heap in use, when the engine exposes it.
    fn heap_used_bytes(&self) -> anyhow::Result<Option<u64>>;
}

/// Raw timing entries, all offsets in milliseconds from navigation start.
#[derive(Debug, Clone, Default)]
pub struct PerformanceSnapshot {
    pub url: String,
    pub navigation: Option<NavigationTiming>,
    pub paints: Vec<PaintTiming>,
    pub resources: Vec<ResourceTiming>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NavigationTiming {
    pub fetch_start: f64,
    pub dom_interactive: f64,
    pub dom_content_loaded_event_start: f64,
    pub dom_content_loaded_event_end: f64,
    pub load_event_start: f64,
    pub load_event_end: f64,
}

#[derive(Debug, Clone)]
pub struct PaintTiming {
    pub name: String,
    pub start_time: f64,
}

#[derive(Debug, Clone)]
pub struct ResourceTiming {
    pub initiator_type: String,
    pub transfer_size: u64,
}

impl PerformanceSnapshot {
    pub fn page_metric(&self) -> PageMetric {
        let nav = self.navigation.unwrap_or_default();
        let first_contentful_paint = self
            .paints
            .iter()
            .find(|p| p.name == "first-contentful-paint")
            .map(|p| p.start_time)
            .unwrap_or(0.0);

        PageMetric {
            url: self.url.clone(),
            load_time: nav.load_event_end - nav.load_event_start,
            dom_content_loaded: nav.dom_content_loaded_event_end
                - nav.dom_content_loaded_event_start,
            first_contentful_paint,
            time_to_interactive: nav.dom_interactive - nav.fetch_start,
            total_size: self.resources.iter().map(|r| r.transfer_size).sum(),
            request_count: self.resources.len() as u64,
        }
    }

    pub fn network_metric(&self, failed_requests: u64) -> NetworkMetric {
        let mut resource_types: HashMap<String, u64> = HashMap::new();
        for resource in &self.resources {
            let kind = if resource.initiator_type.is_empty() {
                "other"
            } else {
                resource.initiator_type.as_str()
            };
            *resource_types.entry(kind.to_string()).or_insert(0) += 1;
        }

        NetworkMetric {
            total_requests: self.resources.len() as u64,
            failed_requests,
            total_transferred: self.resources.iter().map(|r| r.transfer_size).sum(),
            resource_types,
        }
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Accumulates page loads, user actions and visual checks for one browser
/// test run.
#[derive(Debug, Default)]
pub struct E2eMetricsCollector {
    clock: RunClock,
    page_metrics: Vec<PageMetric>,
    action_metrics: Vec<ActionMetric>,
    visual: VisualMetric,
    failed_requests: u64,
    error: Option<E2eTestError>,
}

impl E2eMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a fresh run, discarding anything recorded earlier.
    pub fn start(&mut self) {
        self.page_metrics.clear();
        self.action_metrics.clear();
        self.visual = VisualMetric::default();
        self.failed_requests = 0;
        self.error = None;
        self.clock.start();
    }

    pub fn phase(&self) -> RunPhase {
        self.clock.phase()
    }

    /// Capture the current page's load timings.
    pub fn record_page_metrics(&mut self, probe: &dyn PerformanceProbe) {
        if !self.clock.accepts("page metrics") {
            return;
        }
        let metric = match probe.snapshot() {
            Ok(snapshot) => snapshot.page_metric(),
            Err(e) => {
                warn!("Failed to collect page metrics: {:#}", e);
                PageMetric::default()
            }
        };
        self.page_metrics.push(metric);
    }

    pub fn record_action(
        &mut self,
        action: ActionKind,
        selector: impl Into<String>,
        elapsed: Duration,
        screenshot: Option<String>,
    ) {
        if self.clock.accepts("action") {
            self.action_metrics.push(ActionMetric {
                action,
                selector: selector.into(),
                duration: round_ms(elapsed.as_secs_f64() * 1000.0),
                screenshot,
            });
        }
    }

    pub fn record_screenshot(&mut self) {
        if self.clock.accepts("screenshot") {
            self.visual.screenshots_taken += 1;
        }
    }

    /// Percentage of differing pixels from the latest visual comparison.
    pub fn record_visual_diff(&mut self, diff_percentage: f64) {
        if self.clock.accepts("visual diff") {
            self.visual.visual_diff = Some(diff_percentage);
        }
    }

    pub fn record_snapshot_comparison(&mut self) {
        if self.clock.accepts("snapshot comparison") {
            *self.visual.snapshot_comparisons.get_or_insert(0) += 1;
        }
    }

    pub fn record_failed_request(&mut self) {
        if self.clock.accepts("failed request") {
            self.failed_requests += 1;
        }
    }

    /// Record the failure that ended the run. A later error replaces an
    /// earlier one.
    pub fn record_error(
        &mut self,
        err: &(dyn std::error::Error + 'static),
        screenshot: Option<String>,
        trace: Option<String>,
    ) {
        let (message, stack) = describe_error(err);
        self.record_error_detail(E2eTestError {
            message,
            stack,
            screenshot,
            trace,
            video_url: None,
        });
    }

    pub fn record_error_detail(&mut self, error: E2eTestError) {
        if self.clock.accepts("error") {
            self.error = Some(error);
        }
    }

    pub fn action_count(&self) -> usize {
        self.action_metrics.len()
    }

    pub fn total_page_load_time(&self) -> f64 {
        self.page_metrics.iter().map(|p| p.load_time).sum()
    }

    /// Assemble the summary record, sampling memory and network totals from
    /// `probe`. Recording stays open afterwards.
    pub fn build(
        &mut self,
        info: &RunInfo,
        probe: &dyn PerformanceProbe,
        metadata: Option<Metadata>,
    ) -> E2eTestMetrics {
        let duration = self.clock.finish();

        let memory_usage = match probe.heap_used_bytes() {
            Ok(Some(bytes)) => round_ms(bytes as f64 / BYTES_PER_MB),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to read browser memory usage: {:#}", e);
                0
            }
        };

        let network_metrics = match probe.snapshot() {
            Ok(snapshot) => snapshot.network_metric(self.failed_requests),
            Err(e) => {
                warn!("Failed to collect network metrics: {:#}", e);
                NetworkMetric {
                    failed_requests: self.failed_requests,
                    ..NetworkMetric::default()
                }
            }
        };

        let visual_metrics = (self.visual.screenshots_taken > 0).then(|| self.visual.clone());

        E2eTestMetrics {
            test_id: info.test_id.clone(),
            test_name: info.title.clone(),
            suite_name: info.suite_name(),
            timestamp: Utc::now(),
            environment: info.environment,
            status: RunStatus::from_signal(&info.status),
            duration,
            retry_count: u64::from(info.retry),
            details: E2eDetails {
                browser: Browser::from_name(&info.project_name),
                page_metrics: self.page_metrics.clone(),
                browser_metrics: BrowserMetric {
                    memory_usage,
                    cpu_usage: None,
                },
                action_metrics: self.action_metrics.clone(),
                visual_metrics,
                network_metrics,
                error: self.error.clone(),
            },
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Environment;

    struct FixedProbe(PerformanceSnapshot, Option<u64>);

    impl PerformanceProbe for FixedProbe {
        fn snapshot(&self) -> anyhow::Result<PerformanceSnapshot> {
            Ok(self.0.clone())
        }

        fn heap_used_bytes(&self) -> anyhow::Result<Option<u64>> {
            Ok(self.1)
        }
    }

    struct ClosedPage;

    impl PerformanceProbe for ClosedPage {
        fn snapshot(&self) -> anyhow::Result<PerformanceSnapshot> {
            anyhow::bail!("Target page has been closed")
        }

        fn heap_used_bytes(&self) -> anyhow::Result<Option<u64>> {
            anyhow::bail!("Target page has been closed")
        }
    }

    fn snapshot() -> PerformanceSnapshot {
        PerformanceSnapshot {
            url: "http://localhost:3000/login".into(),
            navigation: Some(NavigationTiming {
                fetch_start: 5.0,
                dom_interactive: 305.0,
                dom_content_loaded_event_start: 310.0,
                dom_content_loaded_event_end: 320.0,
                load_event_start: 400.0,
                load_event_end: 450.0,
            }),
            paints: vec![
                PaintTiming {
                    name: "first-paint".into(),
                    start_time: 100.0,
                },
                PaintTiming {
                    name: "first-contentful-paint".into(),
                    start_time: 120.0,
                },
            ],
            resources: vec![
                ResourceTiming {
                    initiator_type: "script".into(),
                    transfer_size: 1000,
                },
                ResourceTiming {
                    initiator_type: "script".into(),
                    transfer_size: 500,
                },
                ResourceTiming {
                    initiator_type: String::new(),
                    transfer_size: 24,
                },
            ],
        }
    }

    fn info() -> RunInfo {
        RunInfo::new("e2e-1", "logs in")
            .with_status("failed")
            .with_retry(1)
            .with_project("Desktop Firefox")
            .with_environment(Environment::Ci)
    }

    #[test]
    fn test_page_metric_derivation() {
        let page = snapshot().page_metric();
        assert_eq!(page.load_time, 50.0);
        assert_eq!(page.dom_content_loaded, 10.0);
        assert_eq!(page.first_contentful_paint, 120.0);
        assert_eq!(page.time_to_interactive, 300.0);
        assert_eq!(page.total_size, 1524);
        assert_eq!(page.request_count, 3);
    }

    #[test]
    fn test_missing_navigation_gives_zeros() {
        let page = PerformanceSnapshot::default().page_metric();
        assert_eq!(page, PageMetric::default());
    }

    #[test]
    fn test_probe_failure_records_zero_metric() {
        let mut collector = E2eMetricsCollector::new();
        collector.start();
        collector.record_page_metrics(&ClosedPage);
        assert_eq!(collector.total_page_load_time(), 0.0);

        let record = collector.build(&info(), &ClosedPage, None);
        assert_eq!(record.details.page_metrics, vec![PageMetric::default()]);
        assert_eq!(record.details.browser_metrics.memory_usage, 0);
        assert_eq!(record.details.network_metrics.total_requests, 0);
    }

    #[test]
    fn test_build_assembles_record() {
        let probe = FixedProbe(snapshot(), Some(52_428_800));
        let mut collector = E2eMetricsCollector::new();
        collector.start();
        collector.record_page_metrics(&probe);
        collector.record_action(
            ActionKind::Click,
            "#submit",
            Duration::from_micros(12_600),
            None,
        );
        collector.record_failed_request();

        let record = collector.build(&info(), &probe, None);
        let details = &record.details;
        assert_eq!(details.browser, Browser::Firefox);
        assert_eq!(details.browser_metrics.memory_usage, 50);
        assert_eq!(details.action_metrics[0].duration, 13);
        assert_eq!(details.network_metrics.total_requests, 3);
        assert_eq!(details.network_metrics.failed_requests, 1);
        assert_eq!(details.network_metrics.total_transferred, 1524);
        assert_eq!(details.network_metrics.resource_types["script"], 2);
        assert_eq!(details.network_metrics.resource_types["other"], 1);
        assert!(details.visual_metrics.is_none());
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.environment, Environment::Ci);
    }

    #[test]
    fn test_visual_metrics_need_a_screenshot() {
        let probe = FixedProbe(PerformanceSnapshot::default(), None);
        let mut collector = E2eMetricsCollector::new();
        collector.start();
        collector.record_visual_diff(0.4);
        assert!(collector.build(&info(), &probe, None).details.visual_metrics.is_none());

        collector.record_screenshot();
        collector.record_screenshot();
        collector.record_snapshot_comparison();
        let visual = collector
            .build(&info(), &probe, None)
            .details
            .visual_metrics
            .unwrap();
        assert_eq!(visual.screenshots_taken, 2);
        assert_eq!(visual.visual_diff, Some(0.4));
        assert_eq!(visual.snapshot_comparisons, Some(1));
    }

    #[test]
    fn test_actions_before_start_are_dropped() {
        let mut collector = E2eMetricsCollector::new();
        collector.record_action(ActionKind::Type, "#name", Duration::from_millis(5), None);
        collector.record_screenshot();
        assert_eq!(collector.action_count(), 0);
        assert_eq!(collector.phase(), RunPhase::Idle);
    }
}
