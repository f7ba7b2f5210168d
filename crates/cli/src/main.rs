//! UITest CLI - Main Entry Point
//!
//! Loads the harness configuration, starts the application under test once,
//! runs the smoke suite and writes `test-results.json`.
//!
//! Exit codes: 0 when no test failed, 1 when a test failed, 2 when the harness
//! itself could not run.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uitest_e2e::config::DEFAULT_CONFIG_FILE;
use uitest_e2e::{FailStrategy, HarnessConfig, Session, SessionOptions, TestRunner};

mod suite;

#[derive(Parser, Debug)]
#[command(name = "uitest")]
#[command(author, version, about = "UI smoke tests against a managed application", long_about = None)]
struct Args {
    /// Harness config file; searched for from the current directory when omitted
    #[arg(short, long, env = "UITEST_CONFIG")]
    config: Option<PathBuf>,

    /// What tests requiring the application report when it fails to start
    #[arg(long, env = "UITEST_APP_FAIL_STRATEGY")]
    app_fail_strategy: Option<FailStrategy>,

    /// Override the application directory
    #[arg(long)]
    app_dir: Option<PathBuf>,

    /// Override the number of extra start attempts
    #[arg(long)]
    app_retry: Option<u32>,

    /// Output directory for results
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {e}");
            std::process::exit(2);
        }
    };

    match rt.block_on(run(args)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "harness error");
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn init_logging(args: &Args) {
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(|| fmt::layer().with_target(false)))
        .init();
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            HarnessConfig::load(DEFAULT_CONFIG_FILE, &cwd)?
        }
    };

    let options = SessionOptions {
        fail_strategy: args.app_fail_strategy,
        app_dir: args.app_dir,
        app_retry: args.app_retry,
    };
    let session = Session::new(config, options);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        fail_strategy = %session.fail_strategy(),
        "uitest starting"
    );

    let mut runner = TestRunner::new(session, suite::fixtures()).with_output_dir(args.output);

    let results = runner.run(suite::tests()).await?;
    runner.write_results(&results)?;

    Ok(results.success())
}
