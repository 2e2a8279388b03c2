pub mod error;

pub use error::*;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenantflow_http::ApiSettings;
use tenantflow_lifecycle::{RateLimitConfig, ResourceDescriptor, RetryPolicy};
use tracing::{debug, warn};

/// Environment variable pointing directly at a config file
pub const CONFIG_PATH_ENV: &str = "TENANTFLOW_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["tenantflow.local.yaml", "tenantflow.yaml"];

/// Default long-running operation timeout: 20 minutes
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 20 * 60;

/// One week
const MAX_POLL_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Deadline for one long-running operation, in seconds
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
        }
    }
}

impl PollSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Contents of `tenantflow.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub retry: RetryPolicy,
    pub polling: PollSettings,
    pub rate_limit: RateLimitConfig,
    pub api: ApiSettings,
    pub resources: BTreeMap<String, ResourceDescriptor>,
}

impl ProviderConfig {
    pub fn resource(&self, name: &str) -> Result<&ResourceDescriptor> {
        self.resources
            .get(name)
            .ok_or_else(|| ConfigError::UnknownResource(name.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.jitter must be in [0, 1)".to_string(),
            ));
        }
        if self.polling.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.timeout_secs must be positive".to_string(),
            ));
        }
        if self.polling.timeout_secs > MAX_POLL_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "polling.timeout_secs must not exceed {}",
                MAX_POLL_TIMEOUT_SECS
            )));
        }
        if self.retry.retryable.is_empty() {
            warn!("retry.retryable is empty, no error will be retried");
        }
        for (name, descriptor) in &self.resources {
            if descriptor.collection_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "resources.{}.collection_url is empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Global config directory (`~/.config/tenantflow`)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tenantflow"))
}

/// Locate the config file.
///
/// Search order:
/// 1. `TENANTFLOW_CONFIG_PATH`
/// 2. current directory: `tenantflow.local.yaml`, `tenantflow.yaml`
/// 3. `./.tenantflow/`, same names
/// 4. `~/.config/tenantflow/tenantflow.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let local_dir = current_dir.join(".tenantflow");
    if local_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = local_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(dir) = config_dir() {
        let global_config = dir.join("tenantflow.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Find and load the config file.
pub fn load() -> Result<ProviderConfig> {
    let path = find_config_file()?;
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<ProviderConfig> {
    debug!(path = %path.display(), "Loading config");
    let content = std::fs::read_to_string(path)?;
    let config = parse(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// An empty document is a valid, all-defaults config.
fn parse(content: &str) -> std::result::Result<ProviderConfig, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(ProviderConfig::default());
    }
    serde_yaml::from_str(content)
}
