use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use colored::Colorize;
use serde_json::Value;
use tenantflow_config::ProviderConfig;
use tenantflow_http::HttpExecutor;
use tenantflow_lifecycle::{
    DesiredState, LifecycleError, RateLimitedExecutor, RateLimiter, ResourceController,
    TokioClock,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Explicit path if given, otherwise the usual discovery order.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ProviderConfig> {
    let config = match path {
        Some(path) => tenantflow_config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => tenantflow_config::load()?,
    };
    debug!(resources = config.resources.len(), "Config loaded");
    Ok(config)
}

pub fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

pub fn read_desired(path: &Path) -> anyhow::Result<DesiredState> {
    let value = read_json(path)?;
    DesiredState::from_json(&value).with_context(|| format!("in {}", path.display()))
}

pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `policy.rules=name` -> (["policy", "rules"], "name")
pub fn parse_identity(raw: &str) -> anyhow::Result<(Vec<String>, String)> {
    let (path, key) = raw
        .split_once('=')
        .filter(|(path, key)| !path.is_empty() && !key.is_empty())
        .ok_or_else(|| anyhow!("invalid identity '{}', expected <path>=<key>", raw))?;
    Ok((path.split('.').map(str::to_string).collect(), key.to_string()))
}

/// Controller for `resource`, talking to the configured API.
///
/// Ctrl-C cancels in-flight requests and polling waits.
pub fn build_controller(config: &ProviderConfig, resource: &str) -> anyhow::Result<ResourceController> {
    let descriptor = config.resource(resource)?.clone();
    let executor = HttpExecutor::from_env(config.api.clone())?;
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let executor = match &config.api.base_url {
        Some(base_url) => RateLimitedExecutor::new(executor, limiter).with_base_url(base_url),
        None => RateLimitedExecutor::new(executor, limiter),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, stopping (remote operations keep running)".yellow());
            on_interrupt.cancel();
        }
    });

    Ok(ResourceController::new(
        descriptor,
        Arc::new(executor),
        config.retry.clone(),
        Arc::new(TokioClock),
    )
    .with_timeout(config.polling.timeout())
    .with_cancellation(cancel))
}

/// Print a lifecycle failure with its kind and remote detail, then hand it on.
pub fn report(error: LifecycleError) -> anyhow::Error {
    eprintln!("{} {} [{}]", "✗".red().bold(), error, error.kind().yellow());
    if let Some(detail) = error.remote_detail() {
        eprintln!("  {} {}", "remote:".dimmed(), detail);
    }
    match error.kind() {
        "timeout" | "canceled" => {
            eprintln!(
                "{}",
                "  The resource may have been created; read it before retrying.".yellow()
            );
        }
        "not_found" => {
            eprintln!(
                "{}",
                "  The resource no longer exists remotely (drift).".yellow()
            );
        }
        _ => {}
    }
    anyhow::Error::new(error)
}
