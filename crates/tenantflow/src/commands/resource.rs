use std::path::Path;

use colored::Colorize;
use tenantflow_config::ProviderConfig;

use crate::utils;

pub async fn create(config: &ProviderConfig, resource: &str, desired: &Path) -> anyhow::Result<()> {
    let desired = utils::read_desired(desired)?;
    let controller = utils::build_controller(config, resource)?;

    let created = controller.create(&desired).await.map_err(utils::report)?;
    eprintln!("{} Created {} {}", "✓".green(), resource, created.id.cyan());
    utils::print_json(&created)
}

pub async fn read(config: &ProviderConfig, resource: &str, id: &str) -> anyhow::Result<()> {
    let controller = utils::build_controller(config, resource)?;

    match controller.read(id).await.map_err(utils::report)? {
        Some(observed) => utils::print_json(&observed),
        None => {
            eprintln!("{} {} {} does not exist", "!".yellow(), resource, id.cyan());
            utils::print_json(&serde_json::Value::Null)
        }
    }
}

pub async fn update(
    config: &ProviderConfig,
    resource: &str,
    id: &str,
    desired: &Path,
    last_observed: Option<&Path>,
) -> anyhow::Result<()> {
    let desired = utils::read_desired(desired)?;
    let last_observed = last_observed.map(utils::read_json).transpose()?;
    let controller = utils::build_controller(config, resource)?;

    let observed = controller
        .update(id, &desired, last_observed.as_ref())
        .await
        .map_err(utils::report)?;
    eprintln!("{} Updated {} {}", "✓".green(), resource, id.cyan());
    utils::print_json(&observed)
}

pub async fn delete(config: &ProviderConfig, resource: &str, id: &str) -> anyhow::Result<()> {
    let controller = utils::build_controller(config, resource)?;

    controller.delete(id).await.map_err(utils::report)?;
    eprintln!("{} Deleted {} {}", "✓".green(), resource, id.cyan());
    Ok(())
}
