//! Error types for the harness

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Harness-level errors: configuration, IO and client setup
#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Config file not found: {name} (searched: {searched})")]
    ConfigNotFound { name: String, searched: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;

/// Why a single start attempt did not reach RUNNING.
///
/// These never escape the lifecycle manager as errors; they are rendered into
/// the `error` field of a FAILED result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupFailure {
    #[error("application directory does not exist: {}", .0.display())]
    AppDirMissing(PathBuf),

    #[error("process exited early with {}", describe_exit(.code))]
    EarlyExit { code: Option<i32> },

    #[error("health check failed: {url} not healthy within {timeout:?}")]
    HealthCheckTimeout { url: String, timeout: Duration },

    #[error("failed to launch application: {0}")]
    Launch(String),
}

impl StartupFailure {
    /// Stable name of the failure class, recorded in result metadata
    pub fn kind(&self) -> &'static str {
        match self {
            StartupFailure::AppDirMissing(_) => "environment",
            StartupFailure::EarlyExit { .. } => "early_exit",
            StartupFailure::HealthCheckTimeout { .. } => "health_timeout",
            StartupFailure::Launch(_) => "launch",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("return code {code}"),
        None => "no return code (terminated by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_failure_messages() {
        let missing = StartupFailure::AppDirMissing(PathBuf::from("/no/such/app"));
        assert_eq!(
            missing.to_string(),
            "application directory does not exist: /no/such/app"
        );
        assert_eq!(missing.kind(), "environment");

        let exited = StartupFailure::EarlyExit { code: Some(1) };
        assert_eq!(exited.to_string(), "process exited early with return code 1");

        let signalled = StartupFailure::EarlyExit { code: None };
        assert!(signalled.to_string().contains("terminated by signal"));

        let timeout = StartupFailure::HealthCheckTimeout {
            url: "http://127.0.0.1:3000/health".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            timeout.to_string(),
            "health check failed: http://127.0.0.1:3000/health not healthy within 30s"
        );
        assert_eq!(timeout.kind(), "health_timeout");
    }
}
