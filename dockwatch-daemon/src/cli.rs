//! Command-line flags for dockwatch-daemon.

use std::path::PathBuf;

use clap::Parser;
use dockwatch_core::DockwatchConfig;

/// dockwatch container auto-update daemon.
///
/// Periodically checks running containers against their registries and
/// recreates them on newer images.
#[derive(Parser, Debug)]
#[command(name = "dockwatch-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to dockwatch.toml. A missing file means built-in defaults.
    #[arg(short, long, default_value = "/etc/dockwatch/dockwatch.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    /// Run a single scan-and-update and exit.
    #[arg(long)]
    pub once: bool,
}

impl DaemonCli {
    /// Flags take precedence over the file and environment.
    pub fn apply_overrides(&self, config: &mut DockwatchConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
    }
}
