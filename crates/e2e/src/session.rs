//! Test session context
//!
//! A [`Session`] owns the one [`LifecycleManager`] of a test run and provides
//! the hooks the runner calls around tests: setup, the per-test check and
//! teardown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collect::TestItem;
use crate::config::{AppConfig, HarnessConfig};
use crate::error::E2eResult;
use crate::health::HealthProbe;
use crate::lifecycle::{ApplicationStatus, LifecycleManager};
use crate::policy::{FailStrategy, FailureSignal};

/// Options usually coming from the command line
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Strategy for tests when the application failed to start; falls back
    /// to the config file's `fail_strategy`
    pub fail_strategy: Option<FailStrategy>,
    /// Overrides `app.dir`
    pub app_dir: Option<PathBuf>,
    /// Overrides `app.max_retries`
    pub app_retry: Option<u32>,
}

/// Overrides honored only by the first [`Session::app_manager`] call
#[derive(Debug, Clone, Default)]
pub struct ManagerOverrides {
    pub app_dir: Option<PathBuf>,
    pub health_check_url: Option<String>,
}

/// Holds the session's application manager and hook state
pub struct Session {
    config: HarnessConfig,
    options: SessionOptions,
    probe: Option<Arc<dyn HealthProbe>>,
    manager: Option<LifecycleManager>,
    requires_app: HashMap<String, bool>,
    setup_signal: Option<FailureSignal>,
}

impl Session {
    pub fn new(config: HarnessConfig, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            probe: None,
            manager: None,
            requires_app: HashMap::new(),
            setup_signal: None,
        }
    }

    /// Use `probe` instead of HTTP for the manager's health checks
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Effective strategy: options first, then the config file, then skip
    pub fn fail_strategy(&self) -> FailStrategy {
        self.options
            .fail_strategy
            .or(self.config.fail_strategy)
            .unwrap_or_default()
    }

    /// Overrides derived from the session options
    pub fn default_overrides(&self) -> ManagerOverrides {
        ManagerOverrides {
            app_dir: self.options.app_dir.clone(),
            health_check_url: None,
        }
    }

    /// The session's manager, created on first use.
    ///
    /// `overrides` only apply when this call creates the manager; once it
    /// exists every caller gets the same instance unchanged.
    pub fn app_manager(&mut self, overrides: ManagerOverrides) -> E2eResult<&mut LifecycleManager> {
        if let Some(manager) = self.manager.take() {
            if overrides.app_dir.is_some() || overrides.health_check_url.is_some() {
                debug!("application manager already exists, ignoring overrides");
            }
            return Ok(self.manager.insert(manager));
        }

        let manager = self.build_manager(overrides)?;
        Ok(self.manager.insert(manager))
    }

    fn build_manager(&self, overrides: ManagerOverrides) -> E2eResult<LifecycleManager> {
        let mut app: AppConfig = self.config.app.clone();
        if let Some(dir) = overrides.app_dir {
            app.dir = dir;
        }
        if let Some(url) = overrides.health_check_url {
            app.health_check = Some(url);
        }
        if let Some(retries) = self.options.app_retry {
            app.max_retries = retries;
        }
        if app.dir.is_relative() {
            app.dir = std::env::current_dir()?.join(&app.dir);
        }

        info!(
            dir = %app.dir.display(),
            command = %app.command,
            max_retries = app.max_retries,
            health_check = app.health_check_url().unwrap_or("-"),
            "creating application manager"
        );

        let timing = self.config.timing.clone();
        match &self.probe {
            Some(probe) => Ok(LifecycleManager::with_probe(app, timing, Arc::clone(probe))),
            None => LifecycleManager::new(app, timing),
        }
    }

    /// The manager if it has been created
    pub fn manager(&self) -> Option<&LifecycleManager> {
        self.manager.as_ref()
    }

    /// Session setup: start the application once.
    ///
    /// A FAILED start is not an error here. The resulting signal is kept and
    /// handed to every test that requires the application.
    pub async fn setup(&mut self) -> E2eResult<ApplicationStatus> {
        let strategy = self.fail_strategy();
        let overrides = self.default_overrides();
        let manager = self.app_manager(overrides)?;

        let status = manager.start().await.status();
        let signal = manager.handle_failure(Some(strategy)).err();

        match &signal {
            Some(signal) => warn!(strategy = %signal.kind, "application failed to start for this session"),
            None => info!(%status, "application ready for this session"),
        }
        self.setup_signal = signal;

        Ok(status)
    }

    /// Signal recorded by [`Session::setup`], if the start failed
    pub fn setup_signal(&self) -> Option<&FailureSignal> {
        self.setup_signal.as_ref()
    }

    /// Per-test check run before each test body.
    ///
    /// Only items marked as requiring the application are checked. A FAILED
    /// application yields a policy signal; a healthy-looking one is confirmed
    /// through the manager's cached quick health check.
    pub async fn before_test(&mut self, item: &TestItem) -> Result<(), FailureSignal> {
        let requires_app = item.requires_app();
        self.requires_app.insert(item.id().to_string(), requires_app);
        if !requires_app {
            return Ok(());
        }

        let strategy = self.fail_strategy();
        let Some(manager) = self.manager.as_mut() else {
            return Ok(());
        };

        if manager.status() == ApplicationStatus::Failed {
            return manager.handle_failure(Some(strategy));
        }

        if manager.status() == ApplicationStatus::Running
            && !manager.quick_health_check(false).await
        {
            warn!(test = item.id(), "application health check failed before test");
        }

        Ok(())
    }

    /// Whether the per-test check saw `test_id` as requiring the application
    pub fn requires_app(&self, test_id: &str) -> Option<bool> {
        self.requires_app.get(test_id).copied()
    }

    /// Session teardown: stop the application if there is one
    pub async fn teardown(&mut self) {
        match self.manager.as_mut() {
            Some(manager) => manager.stop().await,
            None => debug!("no application manager was created, nothing to tear down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::REQUIRES_APP;
    use crate::config::{CommandSpec, TimingConfig};
    use crate::decorators::from_fn;
    use crate::health::fakes::ScriptedProbe;

    fn config(dir: &str, health_check: Option<&str>) -> HarnessConfig {
        HarnessConfig {
            app: AppConfig {
                dir: PathBuf::from(dir),
                command: CommandSpec::Shell("true".to_string()),
                max_retries: 2,
                health_check: health_check.map(str::to_string),
            },
            fail_strategy: None,
            timing: TimingConfig::default(),
        }
    }

    fn item(id: &str) -> TestItem {
        TestItem::new(id, from_fn(|_| Box::pin(async { Ok(()) })))
    }

    #[test]
    fn test_first_call_wins() {
        let mut session = Session::new(config("/srv/app", None), SessionOptions::default())
            .with_probe(ScriptedProbe::always(true));

        let first = session
            .app_manager(ManagerOverrides {
                app_dir: Some(PathBuf::from("/srv/first")),
                health_check_url: Some("http://127.0.0.1:8080/health".to_string()),
            })
            .unwrap();
        assert_eq!(first.app_dir(), PathBuf::from("/srv/first"));

        let second = session
            .app_manager(ManagerOverrides {
                app_dir: Some(PathBuf::from("/srv/second")),
                health_check_url: None,
            })
            .unwrap();
        assert_eq!(second.app_dir(), PathBuf::from("/srv/first"));
        assert_eq!(second.health_check_url(), Some("http://127.0.0.1:8080/health"));
    }

    #[test]
    fn test_options_override_config() {
        let options = SessionOptions {
            fail_strategy: Some(FailStrategy::Fail),
            app_dir: Some(PathBuf::from("/srv/override")),
            app_retry: Some(0),
        };
        let mut session =
            Session::new(config("/srv/app", None), options).with_probe(ScriptedProbe::always(true));

        let overrides = session.default_overrides();
        let manager = session.app_manager(overrides).unwrap();
        assert_eq!(manager.app_dir(), PathBuf::from("/srv/override"));
        assert_eq!(manager.max_retries(), 0);
    }

    #[test]
    fn test_relative_dir_resolved_against_cwd() {
        let mut session = Session::new(config("webapp", None), SessionOptions::default())
            .with_probe(ScriptedProbe::always(true));

        let manager = session.app_manager(ManagerOverrides::default()).unwrap();
        assert!(manager.app_dir().is_absolute());
        assert!(manager.app_dir().ends_with("webapp"));
    }

    #[tokio::test]
    async fn test_setup_failure_records_signal() {
        let options = SessionOptions {
            fail_strategy: Some(FailStrategy::Xfail),
            ..SessionOptions::default()
        };
        let mut session = Session::new(config("/definitely/not/an/app/dir", None), options)
            .with_probe(ScriptedProbe::always(true));

        let status = session.setup().await.unwrap();
        assert_eq!(status, ApplicationStatus::Failed);

        let signal = session.setup_signal().unwrap();
        assert_eq!(signal.kind, FailStrategy::Xfail);
        assert!(signal.message.starts_with("application failed to start:"));

        let attempt = session.manager().and_then(|m| m.result()).and_then(|r| r.attempt());
        assert_eq!(attempt, Some(3));
    }

    #[test]
    fn test_fail_strategy_resolution() {
        let mut from_file = config("/srv/app", None);
        from_file.fail_strategy = Some(FailStrategy::Xfail);

        let session = Session::new(config("/srv/app", None), SessionOptions::default());
        assert_eq!(session.fail_strategy(), FailStrategy::Skip);

        let session = Session::new(from_file.clone(), SessionOptions::default());
        assert_eq!(session.fail_strategy(), FailStrategy::Xfail);

        let options = SessionOptions {
            fail_strategy: Some(FailStrategy::Fail),
            ..SessionOptions::default()
        };
        let session = Session::new(from_file, options);
        assert_eq!(session.fail_strategy(), FailStrategy::Fail);
    }

    #[tokio::test]
    async fn test_setup_uses_config_file_strategy() {
        let mut config = config("/definitely/not/an/app/dir", None);
        config.fail_strategy = Some(FailStrategy::Xfail);
        let options = SessionOptions {
            app_retry: Some(0),
            ..SessionOptions::default()
        };
        let mut session = Session::new(config, options).with_probe(ScriptedProbe::always(true));

        assert_eq!(session.setup().await.unwrap(), ApplicationStatus::Failed);
        assert_eq!(session.setup_signal().unwrap().kind, FailStrategy::Xfail);

        let needs_app = item("needs_app").mark(REQUIRES_APP);
        let signal = session.before_test(&needs_app).await.unwrap_err();
        assert_eq!(signal.kind, FailStrategy::Xfail);
    }

    #[tokio::test]
    async fn test_before_test_applies_policy_only_to_tagged_items() {
        let options = SessionOptions {
            fail_strategy: Some(FailStrategy::Fail),
            app_retry: Some(0),
            ..SessionOptions::default()
        };
        let mut session = Session::new(config("/definitely/not/an/app/dir", None), options)
            .with_probe(ScriptedProbe::always(true));
        session.setup().await.unwrap();

        let unrelated = item("unrelated");
        assert_eq!(session.before_test(&unrelated).await, Ok(()));
        assert_eq!(session.requires_app("unrelated"), Some(false));

        let needs_app = item("needs_app").mark(REQUIRES_APP);
        let signal = session.before_test(&needs_app).await.unwrap_err();
        assert_eq!(signal.kind, FailStrategy::Fail);
        assert_eq!(session.requires_app("needs_app"), Some(true));
    }

    #[tokio::test]
    async fn test_before_test_without_manager_is_noop() {
        let mut session = Session::new(config("/srv/app", None), SessionOptions::default());
        let needs_app = item("needs_app").mark(REQUIRES_APP);
        assert_eq!(session.before_test(&needs_app).await, Ok(()));
    }

    #[tokio::test]
    async fn test_teardown_without_manager() {
        let mut session = Session::new(config("/srv/app", None), SessionOptions::default());
        session.teardown().await;
        assert!(session.manager().is_none());
    }
}
