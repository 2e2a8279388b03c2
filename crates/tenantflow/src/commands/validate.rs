use std::path::Path;

use colored::Colorize;

pub fn handle(path: Option<&Path>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => tenantflow_config::find_config_file()?,
    };
    println!("{}", "Validating config...".blue());
    println!("File: {}", path.display().to_string().cyan());

    let config = tenantflow_config::load_from(&path)?;

    println!("{}", "✓ Config is valid".green().bold());
    println!();
    println!("Summary:");
    println!(
        "  retry: {} attempt(s), {}ms..{}ms, jitter {}",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.retry.jitter
    );
    println!("  operation timeout: {}s", config.polling.timeout_secs);
    if config.rate_limit.enabled {
        println!(
            "  rate limit: {}/s, {} concurrent per API host",
            config.rate_limit.requests_per_second, config.rate_limit.max_concurrent
        );
    } else {
        println!("  rate limit: {}", "disabled".yellow());
    }
    println!(
        "  api: {} (token from ${})",
        config.api.base_url.as_deref().unwrap_or("(absolute URLs)"),
        config.api.token_env
    );
    println!("  resources: {}", config.resources.len());
    for (name, descriptor) in &config.resources {
        println!(
            "    - {} ({}, update {:?})",
            name.cyan(),
            descriptor.collection_url,
            descriptor.update_mode
        );
    }
    Ok(())
}
