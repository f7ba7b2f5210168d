//! Built-in smoke suite run by the `uitest` binary

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use uitest_e2e::{
    from_fn, ApplicationStatus, FailStrategy, FixtureGraph, TestContext, TestFnExt, TestItem,
    APP_FIXTURE,
};

const HTTP_CLIENT: &str = "http_client";

pub fn fixtures() -> FixtureGraph {
    FixtureGraph::new()
        .fixture(APP_FIXTURE, &[])
        .fixture(HTTP_CLIENT, &[APP_FIXTURE])
}

pub fn tests() -> Vec<TestItem> {
    vec![
        TestItem::new(
            "command_is_configured",
            from_fn(|ctx| Box::pin(command_is_configured(ctx))),
        ),
        TestItem::new(
            "application_is_running",
            from_fn(|ctx| Box::pin(application_is_running(ctx)))
                .handle_app_failure(FailStrategy::Skip),
        )
        .uses(APP_FIXTURE),
        TestItem::new(
            "health_endpoint_responds",
            from_fn(|ctx| Box::pin(health_endpoint_responds(ctx)))
                .retry_on_failure(3, Duration::from_secs(2)),
        )
        .uses(HTTP_CLIENT),
    ]
}

async fn command_is_configured(ctx: &TestContext<'_>) -> anyhow::Result<()> {
    let command = ctx.app().command().to_string();
    anyhow::ensure!(!command.trim().is_empty(), "no startup command configured");
    Ok(())
}

async fn application_is_running(ctx: &TestContext<'_>) -> anyhow::Result<()> {
    let status = ctx.app().status();
    anyhow::ensure!(
        status == ApplicationStatus::Running,
        "expected the application to be RUNNING, found {status}"
    );
    Ok(())
}

async fn health_endpoint_responds(ctx: &TestContext<'_>) -> anyhow::Result<()> {
    let Some(url) = ctx.app().health_check_url() else {
        return Ok(());
    };

    let client = reqwest::Client::builder()
        .timeout(ctx.app().timing().probe_timeout())
        .build()?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    anyhow::ensure!(
        resp.status() == StatusCode::OK,
        "health endpoint returned {}",
        resp.status()
    );
    Ok(())
}
