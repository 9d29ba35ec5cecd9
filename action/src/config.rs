//! Tunables for the action, read from an optional TOML file

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = ".github/azure-psql-action.toml";

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub psql: PsqlConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Where the config was read from; `None` means built-in defaults.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PsqlConfig {
    /// Explicit path to the psql binary. `PSQL_PATH` takes precedence.
    pub binary: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for PsqlConfig {
    fn default() -> Self {
        Self {
            binary: None,
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_single_server_api_version")]
    pub single_server_api_version: String,
    #[serde(default = "default_flexible_server_api_version")]
    pub flexible_server_api_version: String,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_public_ip_endpoint")]
    pub public_ip_endpoint: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            management_endpoint: default_management_endpoint(),
            single_server_api_version: default_single_server_api_version(),
            flexible_server_api_version: default_flexible_server_api_version(),
            operation_timeout_seconds: default_operation_timeout(),
            poll_interval_seconds: default_poll_interval(),
            public_ip_endpoint: default_public_ip_endpoint(),
        }
    }
}

impl AzureConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    /// An operation must get at least one poll before it can time out.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout() < self.poll_interval() {
            bail!(
                "azure.operation_timeout_seconds ({}) must not be shorter than azure.poll_interval_seconds ({})",
                self.operation_timeout_seconds,
                self.poll_interval().as_secs()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

fn default_connect_timeout() -> u64 { 10 }
fn default_management_endpoint() -> String { "https://management.azure.com".into() }
fn default_single_server_api_version() -> String { "2017-12-01".into() }
fn default_flexible_server_api_version() -> String { "2022-12-01".into() }
fn default_operation_timeout() -> u64 { 300 }
fn default_poll_interval() -> u64 { 5 }
fn default_public_ip_endpoint() -> String { "https://api.ipify.org".into() }

/// Load the configuration from `PSQL_ACTION_CONFIG` or the default path.
/// A missing file yields the defaults.
pub fn load_config() -> Result<ActionConfig> {
    let config_path = std::env::var("PSQL_ACTION_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&config_path))
}

pub fn load_config_from(path: &Path) -> Result<ActionConfig> {
    if !path.exists() {
        return Ok(ActionConfig::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let mut config: ActionConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    config
        .azure
        .validate()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    config.loaded_from = Some(path.to_path_buf());
    Ok(config)
}
