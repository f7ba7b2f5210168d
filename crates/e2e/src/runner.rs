//! Test runner - tags, runs and reports a list of test items

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::collect::{tag_requires_app, FixtureGraph, TestItem};
use crate::decorators::TestContext;
use crate::error::E2eResult;
use crate::lifecycle::LifecycleSummary;
use crate::policy::{FailStrategy, FailureSignal};
use crate::session::Session;

/// File name of the JSON report in the output directory
pub const RESULTS_FILE: &str = "test-results.json";

/// How a single test ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
    XFailed { reason: String },
}

impl TestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed { .. })
    }
}

impl From<FailureSignal> for TestOutcome {
    fn from(signal: FailureSignal) -> Self {
        match signal.kind {
            FailStrategy::Fail => TestOutcome::Failed {
                message: signal.message,
            },
            FailStrategy::Skip => TestOutcome::Skipped {
                reason: signal.message,
            },
            FailStrategy::Xfail => TestOutcome::XFailed {
                reason: signal.message,
            },
        }
    }
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub requires_app: bool,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: TestOutcome,
}

/// Result of running all tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub xfailed: usize,
    pub duration_ms: u64,
    /// Application state after the run, when the session started it
    pub app: Option<LifecycleSummary>,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    /// `true` when no test failed
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Runs test items against one session
pub struct TestRunner {
    session: Session,
    fixtures: FixtureGraph,
    output_dir: PathBuf,
}

impl TestRunner {
    pub fn new(session: Session, fixtures: FixtureGraph) -> Self {
        Self {
            session,
            fixtures,
            output_dir: PathBuf::from("test-results"),
        }
    }

    /// Where [`TestRunner::write_results`] puts the report
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Tag, set up, run every item in order, then tear down.
    ///
    /// The application is only started when at least one item requires it.
    /// Teardown runs even when a test fails.
    pub async fn run(&mut self, mut items: Vec<TestItem>) -> E2eResult<TestSuiteResult> {
        let start = Instant::now();
        let needs_app = tag_requires_app(&mut items, &self.fixtures);
        info!(total = items.len(), needs_app, "running tests");

        if needs_app > 0 {
            self.session.setup().await?;
        }

        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            let started = Instant::now();
            let outcome = match self.run_item(item).await {
                Ok(outcome) => outcome,
                Err(e) => TestOutcome::Failed {
                    message: e.to_string(),
                },
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                TestOutcome::Passed => info!(test = item.id(), duration_ms, "✓ passed"),
                TestOutcome::Failed { message } => {
                    error!(test = item.id(), duration_ms, %message, "✗ failed")
                }
                TestOutcome::Skipped { reason } => warn!(test = item.id(), %reason, "- skipped"),
                TestOutcome::XFailed { reason } => {
                    warn!(test = item.id(), %reason, "x expected failure")
                }
            }

            results.push(TestResult {
                name: item.id().to_string(),
                requires_app: item.requires_app(),
                duration_ms,
                outcome,
            });
        }

        let app = self
            .session
            .manager()
            .and_then(|m| m.result())
            .map(|r| r.summary());
        self.session.teardown().await;

        let count = |f: fn(&TestOutcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
        let passed = count(|o| matches!(o, TestOutcome::Passed));
        let failed = count(TestOutcome::is_failure);
        let skipped = count(|o| matches!(o, TestOutcome::Skipped { .. }));
        let xfailed = count(|o| matches!(o, TestOutcome::XFailed { .. }));
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(passed, failed, skipped, xfailed, duration_ms, "test run finished");

        Ok(TestSuiteResult {
            total: results.len(),
            passed,
            failed,
            skipped,
            xfailed,
            duration_ms,
            app,
            results,
        })
    }

    async fn run_item(&mut self, item: &TestItem) -> E2eResult<TestOutcome> {
        debug!(test = item.id(), "running test");

        if item.requires_app() {
            if let Some(signal) = self.session.setup_signal() {
                return Ok(signal.clone().into());
            }
        }
        if let Err(signal) = self.session.before_test(item).await {
            return Ok(signal.into());
        }

        let overrides = self.session.default_overrides();
        let manager = self.session.app_manager(overrides)?;
        let ctx = TestContext::new(item.id(), manager);

        let outcome = match item.body().call(&ctx).await {
            Ok(()) => TestOutcome::Passed,
            Err(e) => match e.downcast::<FailureSignal>() {
                Ok(signal) => signal.into(),
                Err(e) => TestOutcome::Failed {
                    message: format!("{e:#}"),
                },
            },
        };
        Ok(outcome)
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!(path = %path.display(), "results written");
        Ok(path)
    }
}
