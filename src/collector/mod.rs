//! Per-run accumulators that turn timed events into one summary record.
//!
//! One collector value belongs to one test execution. It is driven through
//! `start()`, any number of `record_*` calls, then `build()`. Recording
//! before `start()` is a programmer error: the event is dropped and a
//! warning logged, the test itself is never affected.

pub mod api;
pub mod e2e;

use std::time::Instant;
use tracing::warn;

use crate::metrics::Environment;

pub use api::ApiMetricsCollector;
pub use e2e::{E2eMetricsCollector, PerformanceProbe, PerformanceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Recording,
    Built,
}

/// Lifecycle and wall clock shared by both collectors.
#[derive(Debug)]
pub struct RunClock {
    phase: RunPhase,
    started_at: Option<Instant>,
}

impl RunClock {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            started_at: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.phase = RunPhase::Recording;
    }

    /// Whether an event may be recorded right now.
    pub(crate) fn accepts(&self, event: &str) -> bool {
        if self.phase == RunPhase::Idle {
            warn!("Ignoring {} recorded before start()", event);
            return false;
        }
        true
    }

    /// Elapsed milliseconds since `start()`; marks the run built.
    pub(crate) fn finish(&mut self) -> u64 {
        match self.started_at {
            Some(started) => {
                self.phase = RunPhase::Built;
                crate::metrics::round_ms(started.elapsed().as_secs_f64() * 1000.0)
            }
            None => {
                warn!("build() called before start(); reporting zero duration");
                0
            }
        }
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What the test harness knows about the run being reported.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub test_id: String,
    pub title: String,
    /// File, describe blocks and title, outermost first.
    pub title_path: Vec<String>,
    /// Raw outcome signal from the runner (`passed`, `failed`, ...).
    pub status: String,
    pub retry: u32,
    /// Runner project; the browser engine is derived from it.
    pub project_name: String,
    pub environment: Environment,
}

impl RunInfo {
    pub fn new(test_id: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            test_id: test_id.into(),
            title_path: vec![title.clone()],
            title,
            status: String::new(),
            retry: 0,
            project_name: String::new(),
            environment: Environment::detect(),
        }
    }

    pub fn with_title_path(mut self, title_path: Vec<String>) -> Self {
        self.title_path = title_path;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Every title path segment except the test's own title.
    pub fn suite_name(&self) -> String {
        let parents = self.title_path.len().saturating_sub(1);
        self.title_path[..parents].join(" > ")
    }
}

/// Display text plus the `caused by:` chain of an error.
pub(crate) fn describe_error(err: &(dyn std::error::Error + 'static)) -> (String, Option<String>) {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    let stack = (!causes.is_empty()).then(|| causes.join("\n"));
    (err.to_string(), stack)
}
