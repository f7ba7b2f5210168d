//! Composable wrappers around test bodies
//!
//! A test body is anything implementing [`TestFn`]. Wrappers take a body and
//! return another body, so they stack:
//!
//! ```ignore
//! let body = from_fn(|ctx| Box::pin(async move { login(ctx).await }))
//!     .retry_on_failure(3, Duration::from_secs(2))
//!     .handle_app_failure(FailStrategy::Skip);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use tokio::time::sleep;
use tracing::warn;

use crate::lifecycle::{ApplicationStatus, LifecycleManager};
use crate::policy::{self, FailStrategy, FailureSignal};

/// What a test body gets to see
#[derive(Clone, Copy)]
pub struct TestContext<'a> {
    item_id: &'a str,
    app: &'a LifecycleManager,
}

impl<'a> TestContext<'a> {
    pub fn new(item_id: &'a str, app: &'a LifecycleManager) -> Self {
        Self { item_id, app }
    }

    pub fn item_id(&self) -> &'a str {
        self.item_id
    }

    /// The session's application manager
    pub fn app(&self) -> &'a LifecycleManager {
        self.app
    }
}

/// A runnable test body
#[async_trait(?Send)]
pub trait TestFn {
    async fn call(&self, ctx: &TestContext<'_>) -> anyhow::Result<()>;
}

#[async_trait(?Send)]
impl<T: TestFn + ?Sized> TestFn for Box<T> {
    async fn call(&self, ctx: &TestContext<'_>) -> anyhow::Result<()> {
        (**self).call(ctx).await
    }
}

/// A test body built from a closure, see [`from_fn`]
pub struct FnTest<F>(F);

/// Turn a closure returning a boxed future into a test body
pub fn from_fn<F>(f: F) -> FnTest<F>
where
    F: for<'c> Fn(&'c TestContext<'c>) -> LocalBoxFuture<'c, anyhow::Result<()>>,
{
    FnTest(f)
}

#[async_trait(?Send)]
impl<F> TestFn for FnTest<F>
where
    F: for<'c> Fn(&'c TestContext<'c>) -> LocalBoxFuture<'c, anyhow::Result<()>>,
{
    async fn call(&self, ctx: &TestContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Applies the failure policy before running the body
pub struct HandleAppFailure<T> {
    inner: T,
    strategy: FailStrategy,
}

#[async_trait(?Send)]
impl<T: TestFn> TestFn for HandleAppFailure<T> {
    async fn call(&self, ctx: &TestContext<'_>) -> anyhow::Result<()> {
        let app = ctx.app();
        if app.status() == ApplicationStatus::Failed {
            policy::handle_app_failure(app.result(), Some(self.strategy.as_str()), None)?;
        }
        self.inner.call(ctx).await
    }
}

/// Reruns the body after any error, waiting `delay` between attempts.
///
/// Failure-policy signals pass straight through. The application is not
/// restarted between attempts.
pub struct RetryOnFailure<T> {
    inner: T,
    max_attempts: u32,
    delay: Duration,
}

#[async_trait(?Send)]
impl<T: TestFn> TestFn for RetryOnFailure<T> {
    async fn call(&self, ctx: &TestContext<'_>) -> anyhow::Result<()> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.call(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is::<FailureSignal>() => return Err(e),
                Err(e) => {
                    warn!(
                        test = ctx.item_id(),
                        attempt,
                        attempts,
                        error = %e,
                        "test failed"
                    );
                    if attempt >= attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    sleep(self.delay).await;
                }
            }
        }
    }
}

/// Chaining helpers for test bodies
pub trait TestFnExt: TestFn + Sized {
    fn handle_app_failure(self, strategy: FailStrategy) -> HandleAppFailure<Self> {
        HandleAppFailure {
            inner: self,
            strategy,
        }
    }

    /// Run the body up to `max_attempts` times; zero counts as one
    fn retry_on_failure(self, max_attempts: u32, delay: Duration) -> RetryOnFailure<Self> {
        RetryOnFailure {
            inner: self,
            max_attempts,
            delay,
        }
    }
}

impl<T: TestFn> TestFnExt for T {}
