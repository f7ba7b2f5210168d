//! Health checking - probing the application and waiting for it to be ready

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::E2eResult;
use crate::process::AppProcess;

/// A single readiness probe against a URL
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` only when the application answered as healthy. Network errors
    /// are reported as `false`, never as an error.
    async fn probe(&self, url: &str) -> bool;
}

/// Probes over HTTP; only `200 OK` counts as healthy
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> E2eResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                debug!(url, status = %resp.status(), "health check not ready");
                false
            }
            Err(e) => {
                // Connection refused is expected while the app is starting
                if !e.is_connect() {
                    debug!(url, error = %e, "health check error");
                }
                false
            }
        }
    }
}

/// Polls a probe until the application is healthy or a deadline passes
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, timeout: Duration, interval: Duration) -> Self {
        Self {
            probe,
            timeout,
            interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for `url` to report healthy while `process` keeps running.
    ///
    /// Returns `false` on timeout or as soon as the process exits.
    pub async fn wait_until_healthy(&self, url: &str, process: &mut AppProcess) -> bool {
        self.poll_until_healthy(url, || process.has_exited()).await
    }

    pub(crate) async fn poll_until_healthy<F>(&self, url: &str, mut exited: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < self.timeout {
            if exited() {
                warn!(url, attempts, "application exited while waiting for health check");
                return false;
            }

            attempts += 1;
            if self.probe.probe(url).await {
                info!(url, attempts, "application is healthy");
                return true;
            }
            if attempts == 1 {
                info!(url, "waiting for application to become healthy...");
            }

            sleep(self.interval).await;
        }

        warn!(url, attempts, timeout = ?self.timeout, "health check timed out");
        false
    }
}
