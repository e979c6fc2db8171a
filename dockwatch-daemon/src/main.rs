use anyhow::Result;
use clap::Parser;

use dockwatch_daemon::cli::DaemonCli;
use dockwatch_daemon::logging;
use dockwatch_daemon::orchestrator::{self, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = orchestrator::load_config(&cli.config).await?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {e}"))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "dockwatch-daemon starting"
    );

    let orchestrator = Orchestrator::build_from_config(config)?.with_config_path(&cli.config);

    if cli.once {
        let report = orchestrator.run_once().await?;
        if report.failed > 0 {
            anyhow::bail!("{} container update(s) failed", report.failed);
        }
        return Ok(());
    }

    orchestrator.run().await
}
