//! UITest E2E Harness
//!
//! This crate manages the web application that UI end-to-end tests run
//! against:
//! - Launches the application as a subprocess and retries failed starts
//! - Polls a health endpoint and caches quick health checks for a TTL
//! - Classifies startup failures and maps them to skip, fail or xfail
//! - Runs test items with session setup, per-test checks and teardown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TestRunner                          │
//! │    ├── tag_requires_app(items, FixtureGraph)                │
//! │    ├── Session::setup() / before_test() / teardown()        │
//! │    └── TestFn::call(TestContext) -> TestOutcome             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session                                                    │
//! │    └── app_manager() -> LifecycleManager (one per session)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LifecycleManager                                           │
//! │    ├── start() -> LifecycleResult   (RUNNING | FAILED)      │
//! │    │     ├── AppProcess::spawn()                            │
//! │    │     └── HealthChecker::wait_until_healthy()            │
//! │    ├── stop()                                               │
//! │    ├── quick_health_check(force) ── TtlCache<bool>          │
//! │    └── handle_failure() ── policy::handle_app_failure()     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod collect;
pub mod config;
pub mod decorators;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod policy;
pub mod process;
pub mod runner;
pub mod session;

pub use collect::{tag_requires_app, FixtureGraph, TestItem, APP_FIXTURE, REQUIRES_APP};
pub use config::{AppConfig, CommandSpec, HarnessConfig, TimingConfig};
pub use decorators::{from_fn, TestContext, TestFn, TestFnExt};
pub use error::{E2eError, E2eResult, StartupFailure};
pub use health::{HealthChecker, HealthProbe, HttpProbe};
pub use lifecycle::{ApplicationStatus, LifecycleManager, LifecycleResult, LifecycleSummary};
pub use policy::{handle_app_failure, FailStrategy, FailureSignal};
pub use runner::{TestOutcome, TestResult, TestRunner, TestSuiteResult};
pub use session::{ManagerOverrides, Session, SessionOptions};
