//! Harness configuration loaded from YAML

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::policy::FailStrategy;

/// Config file looked up when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "app_config.yaml";

/// Directory name searched for config files at each level
pub const CONFIG_DIR_NAME: &str = "yaml";

/// How many parent directories discovery walks up
pub const DEFAULT_SEARCH_DEPTH: usize = 5;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// The application under test
    pub app: AppConfig,

    /// Strategy applied when the application fails to start
    #[serde(default)]
    pub fail_strategy: Option<FailStrategy>,

    /// Startup and health-check timing
    #[serde(default)]
    pub timing: TimingConfig,
}

/// The application under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Working directory the application is launched from
    pub dir: PathBuf,

    /// Startup command
    pub command: CommandSpec,

    /// Extra start attempts after the first one fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// URL probed to decide whether the application is ready
    #[serde(default)]
    pub health_check: Option<String>,
}

fn default_max_retries() -> u32 {
    2
}

impl AppConfig {
    /// Health-check URL, treating a blank value as absent
    pub fn health_check_url(&self) -> Option<&str> {
        self.health_check
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// A startup command: either one shell line or an argument vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Build the command to spawn. Shell lines go through the platform shell.
    pub fn to_command(&self) -> E2eResult<Command> {
        match self {
            CommandSpec::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(E2eError::InvalidConfig("startup command is empty".to_string()));
                }
                Ok(shell_command(line))
            }
            CommandSpec::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| {
                    E2eError::InvalidConfig("startup command is empty".to_string())
                })?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(line) => f.write_str(line),
            CommandSpec::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// Timing knobs, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after spawning before the first exit check
    pub startup_grace_ms: u64,

    /// Upper bound for the startup health polling loop
    pub health_timeout_ms: u64,

    /// Per-request timeout for a single probe
    pub probe_timeout_ms: u64,

    /// Pause between probes while polling
    pub poll_interval_ms: u64,

    /// How long a quick health check result is trusted
    pub health_cache_ttl_ms: u64,

    /// How long stop waits after SIGTERM before killing
    pub stop_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: 2_000,
            health_timeout_ms: 30_000,
            probe_timeout_ms: 2_000,
            poll_interval_ms: 1_000,
            health_cache_ttl_ms: 60_000,
            stop_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.health_cache_ttl_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl HarnessConfig {
    /// Parse a config from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    /// Parse a config from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Locate `file_name` starting at `start` and load it
    pub fn load(file_name: &str, start: &Path) -> E2eResult<Self> {
        let path = discover(file_name, start, DEFAULT_SEARCH_DEPTH)?;
        Self::from_file(&path)
    }
}

/// Find a config file.
///
/// Looks for `<dir>/yaml/<file_name>` in `start` and up to `max_depth` of its
/// ancestors, then falls back to `<start>/<file_name>`.
pub fn discover(file_name: &str, start: &Path, max_depth: usize) -> E2eResult<PathBuf> {
    let mut searched = Vec::new();

    for dir in start.ancestors().take(max_depth + 1) {
        let candidate = dir.join(CONFIG_DIR_NAME).join(file_name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "found config file");
            return Ok(candidate);
        }
        searched.push(candidate);
    }

    let sibling = start.join(file_name);
    if sibling.is_file() {
        debug!(path = %sibling.display(), "found config file");
        return Ok(sibling);
    }
    searched.push(sibling);

    Err(E2eError::ConfigNotFound {
        name: file_name.to_string(),
        searched: searched
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}
