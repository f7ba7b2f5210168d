//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::path::Path;

use uitest_e2e::{AppConfig, CommandSpec, TimingConfig};

/// Timings short enough for real subprocesses in tests
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        startup_grace_ms: 200,
        health_timeout_ms: 3_000,
        probe_timeout_ms: 500,
        poll_interval_ms: 50,
        health_cache_ttl_ms: 60_000,
        stop_timeout_ms: 2_000,
    }
}

pub fn app(dir: &Path, command: &str, max_retries: u32, health_check: Option<String>) -> AppConfig {
    AppConfig {
        dir: dir.to_path_buf(),
        command: CommandSpec::Shell(command.to_string()),
        max_retries,
        health_check,
    }
}
