//! Failure policy - turning a failed startup into a test outcome
//!
//! Every caller that reacts to a FAILED application (session setup, the
//! per-test check, decorators, the manager's default handler) goes through
//! [`handle_app_failure`], so messages and strategy precedence are the same
//! everywhere: explicit strategy, then the configured default, then skip.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::lifecycle::{ApplicationStatus, LifecycleResult};

/// How many characters of captured stderr go into a failure message
pub const STDERR_PREVIEW_CHARS: usize = 500;

/// What a test sees when the application could not be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailStrategy {
    /// Report the test as failed
    Fail,
    /// Report the test as skipped
    #[default]
    Skip,
    /// Report the test as an expected failure
    Xfail,
}

impl FailStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailStrategy::Fail => "fail",
            FailStrategy::Skip => "skip",
            FailStrategy::Xfail => "xfail",
        }
    }

    /// Pick the strategy for a token: the token itself if recognized, else
    /// the configured default, else skip.
    pub fn resolve(token: Option<&str>, configured: Option<FailStrategy>) -> FailStrategy {
        if let Some(token) = token {
            match token.parse() {
                Ok(strategy) => return strategy,
                Err(e) => warn!(error = %e, "falling back to configured failure strategy"),
            }
        }
        configured.unwrap_or_default()
    }
}

impl fmt::Display for FailStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown failure strategy '{0}' (expected skip, fail or xfail)")]
pub struct UnknownStrategy(pub String);

impl FromStr for FailStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fail" => Ok(FailStrategy::Fail),
            "skip" => Ok(FailStrategy::Skip),
            "xfail" => Ok(FailStrategy::Xfail),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Raised instead of running a test when the application is down.
///
/// Carried as an error so test bodies and hooks can propagate it with `?`;
/// the runner maps `kind` onto the reported outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {message}")]
pub struct FailureSignal {
    pub kind: FailStrategy,
    pub message: String,
}

/// Compose the message shown for a failed startup
pub fn failure_message(result: &LifecycleResult) -> String {
    let mut message = format!(
        "application failed to start: {}",
        result.error().unwrap_or("unknown error")
    );

    let stderr = result.stderr();
    if !stderr.is_empty() {
        let preview: String = stderr.chars().take(STDERR_PREVIEW_CHARS).collect();
        message.push_str("\nstderr:\n");
        message.push_str(&preview);
        if stderr.chars().count() > STDERR_PREVIEW_CHARS {
            message.push_str("...");
        }
    }

    message
}

/// Convert a FAILED result into a signal.
///
/// Returns `Ok(())` when there is no result or the result is not FAILED.
pub fn handle_app_failure(
    result: Option<&LifecycleResult>,
    strategy: Option<&str>,
    configured: Option<FailStrategy>,
) -> Result<(), FailureSignal> {
    let Some(result) = result.filter(|r| r.status() == ApplicationStatus::Failed) else {
        return Ok(());
    };

    Err(FailureSignal {
        kind: FailStrategy::resolve(strategy, configured),
        message: failure_message(result),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartupFailure;
    use crate::process::CapturedOutput;
    use std::path::PathBuf;
    use test_case::test_case;

    fn failed_result(stderr: &str) -> LifecycleResult {
        LifecycleResult::failed(
            &StartupFailure::EarlyExit { code: Some(1) },
            CapturedOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
            1,
        )
    }

    #[test_case("fail", FailStrategy::Fail ; "fail token")]
    #[test_case("skip", FailStrategy::Skip ; "skip token")]
    #[test_case("xfail", FailStrategy::Xfail ; "xfail token")]
    fn test_explicit_strategy_wins(token: &str, expected: FailStrategy) {
        let result = failed_result("");
        let signal = handle_app_failure(Some(&result), Some(token), Some(FailStrategy::Fail))
            .unwrap_err();
        assert_eq!(signal.kind, expected);
        assert_eq!(
            signal.message,
            "application failed to start: process exited early with return code 1"
        );
    }

    #[test_case(None, None, FailStrategy::Skip ; "nothing configured")]
    #[test_case(None, Some(FailStrategy::Xfail), FailStrategy::Xfail ; "configured default")]
    #[test_case(Some("explode"), Some(FailStrategy::Fail), FailStrategy::Fail ; "unknown token uses configured")]
    #[test_case(Some("explode"), None, FailStrategy::Skip ; "unknown token without config")]
    fn test_strategy_fallback(
        token: Option<&str>,
        configured: Option<FailStrategy>,
        expected: FailStrategy,
    ) {
        assert_eq!(FailStrategy::resolve(token, configured), expected);
    }

    #[test]
    fn test_no_result_is_noop() {
        assert_eq!(handle_app_failure(None, Some("fail"), None), Ok(()));
    }

    #[test]
    fn test_non_failed_result_is_noop() {
        let mut result = failed_result("");
        result.mark_stopped(CapturedOutput::default());
        assert_eq!(handle_app_failure(Some(&result), Some("fail"), None), Ok(()));
    }

    #[test]
    fn test_message_includes_truncated_stderr() {
        let stderr = "x".repeat(STDERR_PREVIEW_CHARS + 20);
        let message = failure_message(&failed_result(&stderr));

        let (head, tail) = message.split_once("\nstderr:\n").unwrap();
        assert_eq!(head, "application failed to start: process exited early with return code 1");
        assert_eq!(tail.len(), STDERR_PREVIEW_CHARS + 3);
        assert!(tail.ends_with("..."));
    }

    #[test]
    fn test_message_short_stderr_untruncated() {
        let message = failure_message(&failed_result("boom\n"));
        assert!(message.ends_with("\nstderr:\nboom\n"));
    }

    #[test]
    fn test_message_for_missing_directory() {
        let result = LifecycleResult::failed(
            &StartupFailure::AppDirMissing(PathBuf::from("/nope")),
            CapturedOutput::default(),
            3,
        );
        let signal = handle_app_failure(Some(&result), Some("skip"), None).unwrap_err();
        assert!(signal.message.contains("directory does not exist"));
        assert_eq!(signal.to_string(), format!("[skip] {}", signal.message));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(" xfail ".parse::<FailStrategy>(), Ok(FailStrategy::Xfail));
        assert_eq!(
            "retry".parse::<FailStrategy>(),
            Err(UnknownStrategy("retry".to_string()))
        );
    }
}
