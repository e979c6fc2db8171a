//! Argument definitions. Declarative only; no I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// dockwatch -- keep containers on the latest image for their tag.
///
/// Use `dockwatch <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "dockwatch", version, about, long_about = None)]
pub struct Cli {
    /// Path to dockwatch.toml. A missing file means built-in defaults.
    #[arg(short, long, global = true, default_value = "dockwatch.toml")]
    pub config: PathBuf,

    /// Log level for diagnostics on stderr.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table / text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check every container against its registry once.
    Scan(ScanArgs),

    /// Recreate one container on a freshly pulled image.
    Update(UpdateArgs),

    /// Inspect or validate the configuration.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Include stopped containers.
    #[arg(long)]
    pub include_stopped: bool,

    /// Bypass the digest cache.
    #[arg(long, conflicts_with = "cache_only")]
    pub no_cache: bool,

    /// Do not contact registries; only cached digests are compared.
    #[arg(long)]
    pub cache_only: bool,

    /// Parallel container checks (1-64). Defaults to `scan.concurrency`.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub concurrency: Option<u16>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Container id or name.
    pub container: String,

    /// Image reference to update to. Defaults to the container's own image.
    #[arg(long)]
    pub image: Option<String>,

    /// Give up after this many seconds. Defaults to `scan.update_timeout_secs`.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Load and validate the configuration.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Only this section (general, docker, scan, policy, registry, metrics).
        #[arg(long)]
        section: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn scan_flags() {
        let cli = Cli::try_parse_from([
            "dockwatch",
            "scan",
            "--include-stopped",
            "--no-cache",
            "--concurrency",
            "8",
            "--output",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert!(args.include_stopped);
        assert!(args.no_cache);
        assert_eq!(args.concurrency, Some(8));
    }

    #[test]
    fn no_cache_conflicts_with_cache_only() {
        assert!(Cli::try_parse_from(["dockwatch", "scan", "--no-cache", "--cache-only"]).is_err());
    }

    #[test]
    fn concurrency_is_bounded() {
        assert!(Cli::try_parse_from(["dockwatch", "scan", "--concurrency", "0"]).is_err());
        assert!(Cli::try_parse_from(["dockwatch", "scan", "--concurrency", "65"]).is_err());
    }

    #[test]
    fn update_requires_container() {
        assert!(Cli::try_parse_from(["dockwatch", "update"]).is_err());
        let cli = Cli::try_parse_from(["dockwatch", "update", "web", "--image", "nginx:1.27"]).unwrap();
        let Commands::Update(args) = cli.command else {
            panic!("expected update");
        };
        assert_eq!(args.container, "web");
        assert_eq!(args.image.as_deref(), Some("nginx:1.27"));
        assert_eq!(args.timeout_secs, None);
    }

    #[test]
    fn config_show_section() {
        let cli = Cli::try_parse_from(["dockwatch", "config", "show", "--section", "scan"]).unwrap();
        let Commands::Config(ConfigArgs {
            action: ConfigAction::Show { section },
        }) = cli.command
        else {
            panic!("expected config show");
        };
        assert_eq!(section.as_deref(), Some("scan"));
    }
}
