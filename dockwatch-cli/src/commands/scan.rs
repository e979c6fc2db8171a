//! `dockwatch scan`

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dockwatch_core::{ConfigProvider, ContainerStatus, DockwatchConfig, ScanStatus};
use dockwatch_watcher::{RegistryResolver, ScanOptions, Scanner};

use crate::cli::ScanArgs;
use crate::commands::{connect_docker, load_config};
use crate::error::CliError;
use crate::output::{OutputWriter, Render, short_id, truncate};

pub async fn execute(args: ScanArgs, config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    let config = load_config(config_path).await?;
    let options = scan_options(&args, &config);
    let provider: Arc<dyn ConfigProvider> = Arc::new(Arc::new(config.clone()));

    let docker = Arc::new(connect_docker(&config)?);
    let resolver = Arc::new(
        RegistryResolver::from_config(Arc::clone(&provider))
            .map_err(|e| CliError::Config(e.to_string()))?,
    );
    let scanner = Scanner::new(docker, resolver, provider);

    info!(?options, "scanning containers");
    let cancel = CancellationToken::new();
    let statuses = tokio::select! {
        r = scanner.scan_once(&cancel, options) => r?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Err(CliError::Command("scan interrupted".to_owned()));
        }
    };

    writer.render(&ScanReport::new(statuses))
}

pub(crate) fn scan_options(args: &ScanArgs, config: &DockwatchConfig) -> ScanOptions {
    ScanOptions {
        include_stopped: args.include_stopped || config.docker.include_stopped,
        concurrency: args
            .concurrency
            .map_or(config.scan.concurrency, usize::from),
        use_cache: !args.no_cache,
        resolve_remote: !args.cache_only,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ScanSummary {
    pub total: usize,
    pub up_to_date: usize,
    pub update_available: usize,
    pub skipped: usize,
    pub error: usize,
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub summary: ScanSummary,
    pub containers: Vec<ContainerStatus>,
}

impl ScanReport {
    pub fn new(containers: Vec<ContainerStatus>) -> Self {
        let mut summary = ScanSummary {
            total: containers.len(),
            ..ScanSummary::default()
        };
        for c in &containers {
            match c.status {
                ScanStatus::UpToDate => summary.up_to_date += 1,
                ScanStatus::UpdateAvailable => summary.update_available += 1,
                ScanStatus::Skipped => summary.skipped += 1,
                ScanStatus::Error => summary.error += 1,
            }
        }
        Self { summary, containers }
    }
}

impl Render for ScanReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        if self.containers.is_empty() {
            writeln!(w, "No containers found.")?;
            return Ok(());
        }

        writeln!(
            w,
            "{:<12} {:<24} {:<36} {:<16} Detail",
            "ID", "Name", "Image", "Status"
        )?;
        writeln!(w, "{}", "-".repeat(100))?;

        for c in &self.containers {
            let status = format!("{:<16}", c.status.as_str());
            let status = match c.status {
                ScanStatus::UpToDate => status.green(),
                ScanStatus::UpdateAvailable => status.yellow().bold(),
                ScanStatus::Skipped => status.dimmed(),
                ScanStatus::Error => status.red(),
            };
            let detail = match c.status {
                ScanStatus::UpdateAvailable => truncate(&c.remote_digest, 24),
                _ => c.skip_reason.clone(),
            };
            writeln!(
                w,
                "{:<12} {:<24} {:<36} {} {}",
                short_id(&c.id),
                truncate(&c.name, 24),
                truncate(&c.image, 36),
                status,
                detail
            )?;
        }

        writeln!(w)?;
        let s = &self.summary;
        let line = format!(
            "{} containers: {} up to date, {} update available, {} skipped, {} error",
            s.total, s.up_to_date, s.update_available, s.skipped, s.error
        );
        if s.update_available > 0 {
            writeln!(w, "{}", line.yellow().bold())
        } else {
            writeln!(w, "{}", line.bold())
        }
    }
}
