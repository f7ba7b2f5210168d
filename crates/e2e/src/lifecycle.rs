//! Application lifecycle management
//!
//! [`LifecycleManager`] owns the single application instance of a test
//! session. Hooks and decorators only look at [`LifecycleResult::status`];
//! launching, retrying and health checking stay in here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::config::{AppConfig, CommandSpec, TimingConfig};
use crate::error::{E2eResult, StartupFailure};
use crate::health::{HealthChecker, HealthProbe, HttpProbe};
use crate::policy::{self, FailStrategy, FailureSignal};
use crate::process::{AppProcess, CapturedOutput};

/// Metadata key holding the 1-based attempt that produced a result
pub const ATTEMPT_KEY: &str = "attempt";

/// Metadata key holding the [`StartupFailure::kind`] of a failed result
pub const FAILURE_KIND_KEY: &str = "failure_kind";

/// Where the application is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    NotStarted,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::NotStarted => "NOT_STARTED",
            ApplicationStatus::Starting => "STARTING",
            ApplicationStatus::Running => "RUNNING",
            ApplicationStatus::Failed => "FAILED",
            ApplicationStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `start()` call.
///
/// While attempts are in progress the current result is STARTING and carries
/// the attempt number. A RUNNING result always owns the live process; a FAILED result never holds
/// one. `stop()` takes the process out and moves the result to STOPPED.
#[derive(Debug)]
pub struct LifecycleResult {
    status: ApplicationStatus,
    process: Option<AppProcess>,
    error: Option<String>,
    stdout: String,
    stderr: String,
    start_time: DateTime<Utc>,
    metadata: BTreeMap<String, Value>,
}

impl LifecycleResult {
    fn starting(attempt: u32) -> Self {
        Self {
            status: ApplicationStatus::Starting,
            process: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            start_time: Utc::now(),
            metadata: BTreeMap::from([(ATTEMPT_KEY.to_string(), Value::from(attempt))]),
        }
    }

    fn running(process: AppProcess, attempt: u32) -> Self {
        Self {
            status: ApplicationStatus::Running,
            process: Some(process),
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            start_time: Utc::now(),
            metadata: BTreeMap::from([(ATTEMPT_KEY.to_string(), Value::from(attempt))]),
        }
    }

    pub(crate) fn failed(failure: &StartupFailure, output: CapturedOutput, attempt: u32) -> Self {
        Self {
            status: ApplicationStatus::Failed,
            process: None,
            error: Some(failure.to_string()),
            stdout: output.stdout,
            stderr: output.stderr,
            start_time: Utc::now(),
            metadata: BTreeMap::from([
                (ATTEMPT_KEY.to_string(), Value::from(attempt)),
                (FAILURE_KIND_KEY.to_string(), Value::from(failure.kind())),
            ]),
        }
    }

    pub(crate) fn mark_stopped(&mut self, output: CapturedOutput) {
        self.status = ApplicationStatus::Stopped;
        self.stdout = output.stdout;
        self.stderr = output.stderr;
    }

    pub fn status(&self) -> ApplicationStatus {
        self.status
    }

    pub fn process(&self) -> Option<&AppProcess> {
        self.process.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn attempt(&self) -> Option<u32> {
        self.metadata
            .get(ATTEMPT_KEY)
            .and_then(Value::as_u64)
            .and_then(|a| u32::try_from(a).ok())
    }

    /// Process-free view of this result for reports
    pub fn summary(&self) -> LifecycleSummary {
        LifecycleSummary {
            status: self.status,
            error: self.error.clone(),
            attempt: self.attempt(),
            start_time: self.start_time,
            pid: self.process.as_ref().and_then(AppProcess::id),
        }
    }
}

/// Serializable snapshot of a [`LifecycleResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSummary {
    pub status: ApplicationStatus,
    pub error: Option<String>,
    pub attempt: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
}

/// Custom reaction to a FAILED result, replacing the failure policy
pub type ExceptionHandler =
    Box<dyn Fn(&LifecycleResult, Option<FailStrategy>) -> Result<(), FailureSignal> + Send + Sync>;

struct AttemptFailure {
    failure: StartupFailure,
    output: CapturedOutput,
}

impl AttemptFailure {
    fn bare(failure: StartupFailure) -> Self {
        Self {
            failure,
            output: CapturedOutput::default(),
        }
    }
}

/// Owns the application under test for one session
pub struct LifecycleManager {
    app_dir: PathBuf,
    command: CommandSpec,
    max_retries: u32,
    health_check_url: Option<String>,
    timing: TimingConfig,
    probe: Arc<dyn HealthProbe>,
    checker: HealthChecker,
    current: Option<LifecycleResult>,
    health_cache: TtlCache<bool>,
    exception_handler: Option<ExceptionHandler>,
}

impl LifecycleManager {
    /// Create a manager probing health over HTTP
    pub fn new(app: AppConfig, timing: TimingConfig) -> E2eResult<Self> {
        let probe = Arc::new(HttpProbe::new(timing.probe_timeout())?);
        Ok(Self::with_probe(app, timing, probe))
    }

    /// Create a manager with a custom health probe
    pub fn with_probe(app: AppConfig, timing: TimingConfig, probe: Arc<dyn HealthProbe>) -> Self {
        let health_check_url = app.health_check_url().map(str::to_string);
        let checker = HealthChecker::new(
            Arc::clone(&probe),
            timing.health_timeout(),
            timing.poll_interval(),
        );

        Self {
            app_dir: app.dir,
            command: app.command,
            max_retries: app.max_retries,
            health_check_url,
            health_cache: TtlCache::new(timing.health_cache_ttl()),
            timing,
            probe,
            checker,
            current: None,
            exception_handler: None,
        }
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check_url.as_deref()
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// The result of the last `start()`, if there was one
    pub fn result(&self) -> Option<&LifecycleResult> {
        self.current.as_ref()
    }

    pub fn status(&self) -> ApplicationStatus {
        self.current
            .as_ref()
            .map_or(ApplicationStatus::NotStarted, LifecycleResult::status)
    }

    /// Start the application, retrying up to `max_retries` times.
    ///
    /// The returned result also becomes [`LifecycleManager::result`]. Startup
    /// problems are reported through a FAILED result, never as an error.
    pub async fn start(&mut self) -> &LifecycleResult {
        if self.current.as_ref().is_some_and(|r| r.process.is_some()) {
            warn!("application is already running, stopping it before starting again");
            self.stop().await;
        }
        self.health_cache.invalidate();

        let total = self.max_retries.saturating_add(1);
        let mut attempt = 1;
        let result = loop {
            self.current = Some(LifecycleResult::starting(attempt));
            info!(
                attempt,
                total,
                dir = %self.app_dir.display(),
                "starting application"
            );

            match self.attempt_start().await {
                Ok(process) => {
                    info!(attempt, pid = ?process.id(), "application started");
                    break LifecycleResult::running(process, attempt);
                }
                Err(AttemptFailure { failure, output }) => {
                    error!(
                        attempt,
                        total,
                        kind = failure.kind(),
                        error = %failure,
                        "startup attempt failed"
                    );
                    if attempt >= total {
                        break LifecycleResult::failed(&failure, output, attempt);
                    }
                    attempt += 1;
                }
            }
        };

        &*self.current.insert(result)
    }

    async fn attempt_start(&self) -> Result<AppProcess, AttemptFailure> {
        if !self.app_dir.is_dir() {
            return Err(AttemptFailure::bare(StartupFailure::AppDirMissing(
                self.app_dir.clone(),
            )));
        }

        let mut process = AppProcess::spawn(&self.command, &self.app_dir)
            .map_err(|e| AttemptFailure::bare(StartupFailure::Launch(e.to_string())))?;

        sleep(self.timing.startup_grace()).await;
        if process.has_exited() {
            return Err(early_exit(process).await);
        }

        if let Some(url) = &self.health_check_url {
            if !self.checker.wait_until_healthy(url, &mut process).await {
                if process.has_exited() {
                    return Err(early_exit(process).await);
                }

                if let Err(e) = process.terminate(self.timing.stop_timeout()).await {
                    warn!(error = %e, "failed to terminate unhealthy application");
                }
                return Err(AttemptFailure {
                    failure: StartupFailure::HealthCheckTimeout {
                        url: url.clone(),
                        timeout: self.checker.timeout(),
                    },
                    output: process.output(),
                });
            }
        }

        Ok(process)
    }

    /// Stop the application if this manager holds a running process.
    ///
    /// Safe to call at any time; without a process it only logs.
    pub async fn stop(&mut self) {
        let Some(result) = self.current.as_mut() else {
            info!("application was never started, nothing to stop");
            return;
        };
        let Some(mut process) = result.process.take() else {
            info!(status = %result.status, "no application process to stop");
            return;
        };

        info!(pid = ?process.id(), "stopping application");
        match process.terminate(self.timing.stop_timeout()).await {
            Ok(code) => info!(?code, "application stopped"),
            Err(e) => warn!(error = %e, "application did not stop cleanly"),
        }

        result.mark_stopped(process.output());
        self.health_cache.invalidate();
    }

    /// Cheap health check backed by the TTL cache.
    ///
    /// Without a configured URL the application counts as healthy.
    pub async fn quick_health_check(&mut self, force: bool) -> bool {
        let Some(url) = self.health_check_url.clone() else {
            return true;
        };

        let probe = Arc::clone(&self.probe);
        let healthy = self
            .health_cache
            .get_or_refresh(force, || async move { probe.probe(&url).await })
            .await;
        debug!(healthy, force, "quick health check");
        healthy
    }

    /// Cached health value if still fresh, without probing
    pub fn cached_health(&self) -> Option<bool> {
        self.health_cache.get()
    }

    /// Replace the default failure policy for this manager
    pub fn set_exception_handler(&mut self, handler: ExceptionHandler) {
        self.exception_handler = Some(handler);
    }

    /// React to a FAILED result through the custom handler or the failure
    /// policy. Does nothing unless the current result is FAILED.
    pub fn handle_failure(&self, configured: Option<FailStrategy>) -> Result<(), FailureSignal> {
        let Some(result) = self
            .current
            .as_ref()
            .filter(|r| r.status == ApplicationStatus::Failed)
        else {
            return Ok(());
        };

        match &self.exception_handler {
            Some(handler) => handler(result, configured),
            None => policy::handle_app_failure(Some(result), None, configured),
        }
    }
}

async fn early_exit(process: AppProcess) -> AttemptFailure {
    let report = process.collect_exit().await;
    AttemptFailure {
        failure: StartupFailure::EarlyExit { code: report.code },
        output: report.output,
    }
}
