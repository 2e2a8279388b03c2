mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenantflow")]
#[command(about = "Declare it, and the tenant converges.", long_about = None)]
struct Cli {
    /// Config file (defaults to tenantflow.yaml discovery)
    #[arg(short, long, global = true, env = "TENANTFLOW_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the patch that moves an observed state toward a desired one (offline)
    Diff {
        /// Desired configuration (JSON, partial)
        #[arg(short, long)]
        desired: PathBuf,
        /// Observed state (JSON, full)
        #[arg(short, long)]
        observed: PathBuf,
        /// Match sequence elements by key, e.g. `rules=name` or `policy.rules=id`
        #[arg(short, long)]
        identity: Vec<String>,
        /// Print the predicted state after the patch instead of the patch
        #[arg(long)]
        project: bool,
    },
    /// Create a resource
    Create {
        /// Resource name under `resources` in the config
        #[arg(short, long)]
        resource: String,
        /// Desired configuration (JSON)
        #[arg(short, long)]
        desired: PathBuf,
    },
    /// Read a resource's current state
    Read {
        #[arg(short, long)]
        resource: String,
        /// Remote identifier
        id: String,
    },
    /// Apply a partial update
    Update {
        #[arg(short, long)]
        resource: String,
        id: String,
        /// Desired configuration (JSON, partial)
        #[arg(short, long)]
        desired: PathBuf,
        /// Last observed state, used for drift detection
        #[arg(long)]
        last_observed: Option<PathBuf>,
    },
    /// Delete a resource (already gone counts as success)
    Delete {
        #[arg(short, long)]
        resource: String,
        id: String,
    },
    /// Validate the config file
    Validate,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries JSON results, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Version => {
            println!("tenantflow {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Diff {
            desired,
            observed,
            identity,
            project,
        } => {
            commands::diff::handle(&desired, &observed, &identity, project)?;
        }
        Commands::Validate => {
            commands::validate::handle(cli.config.as_deref())?;
        }
        Commands::Create { resource, desired } => {
            let config = utils::load_config(cli.config.as_deref())?;
            commands::resource::create(&config, &resource, &desired).await?;
        }
        Commands::Read { resource, id } => {
            let config = utils::load_config(cli.config.as_deref())?;
            commands::resource::read(&config, &resource, &id).await?;
        }
        Commands::Update {
            resource,
            id,
            desired,
            last_observed,
        } => {
            let config = utils::load_config(cli.config.as_deref())?;
            commands::resource::update(&config, &resource, &id, &desired, last_observed.as_deref())
                .await?;
        }
        Commands::Delete { resource, id } => {
            let config = utils::load_config(cli.config.as_deref())?;
            commands::resource::delete(&config, &resource, &id).await?;
        }
    }

    Ok(())
}
