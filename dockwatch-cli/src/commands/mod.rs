//! Command handlers, one module per subcommand.

pub mod config;
pub mod scan;
pub mod update;

use std::path::Path;

use dockwatch_core::DockwatchConfig;
use dockwatch_watcher::BollardDockerClient;

use crate::error::CliError;

/// Loads `path` with env overrides and validation. A missing file means
/// defaults, still with env overrides applied.
pub async fn load_config(path: &Path) -> Result<DockwatchConfig, CliError> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(DockwatchConfig::load(path).await?);
    }
    let mut config = DockwatchConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub(crate) fn connect_docker(config: &DockwatchConfig) -> Result<BollardDockerClient, CliError> {
    Ok(BollardDockerClient::connect(&config.docker.socket)?)
}
