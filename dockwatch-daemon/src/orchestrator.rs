//! Component wiring and daemon lifecycle.
//!
//! The [`Orchestrator`] owns the shared configuration and builds the
//! pipeline from it:
//!
//! ```text
//! SharedConfig ─┬─▶ RegistryResolver (HTTP fetcher, digest cache, credentials)
//!               ├─▶ Scanner  (BollardDockerClient + resolver)
//!               ├─▶ Updater  (BollardDockerClient)
//!               └─▶ Scheduler(scanner, updater)
//! ```
//!
//! `run` starts the scheduler and blocks until SIGTERM or SIGINT, then stops
//! the scheduler and waits for an in-flight run to drain. SIGHUP re-reads
//! the configuration file and publishes it as a new snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dockwatch_core::{ConfigProvider, DockwatchConfig, SharedConfig};
use dockwatch_watcher::registry::HttpManifestFetcher;
use dockwatch_watcher::scheduler::ScheduleMode;
use dockwatch_watcher::{BollardDockerClient, RegistryResolver, RunReport, Scanner, Scheduler, Updater};
use tokio_util::sync::CancellationToken;

use crate::metrics_server;

pub type DockerResolver = RegistryResolver<HttpManifestFetcher>;
pub type DockerScheduler = Scheduler<BollardDockerClient, DockerResolver, BollardDockerClient>;

/// Loads `path`, falling back to defaults when the file does not exist.
/// Environment overrides are applied and the result is validated.
pub async fn load_config(path: &Path) -> Result<DockwatchConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return DockwatchConfig::load(path)
            .await
            .with_context(|| format!("failed to load config {}", path.display()));
    }

    let mut config = DockwatchConfig::default();
    config.apply_env_overrides();
    config.validate().context("config validation failed")?;
    Ok(config)
}

/// Owns every long-lived component of the daemon.
pub struct Orchestrator {
    config_path: Option<PathBuf>,
    config: SharedConfig,
    docker: Arc<BollardDockerClient>,
    resolver: Arc<DockerResolver>,
    scheduler: DockerScheduler,
    start_time: Instant,
}

impl Orchestrator {
    /// Loads the file at `config_path` and builds from it. SIGHUP reloads
    /// the same file.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path).await?;
        Ok(Self::build_from_config(config)?.with_config_path(config_path))
    }

    /// Builds from an already-loaded configuration.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unusable Docker socket, a bad registry
    /// proxy, or a metrics listener that cannot be installed.
    pub fn build_from_config(config: DockwatchConfig) -> Result<Self> {
        config.validate().context("config validation failed")?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let docker = Arc::new(
            BollardDockerClient::connect(&config.docker.socket)
                .context("failed to create docker client")?,
        );

        let shared = SharedConfig::new(config);
        let provider: Arc<dyn ConfigProvider> = Arc::new(shared.clone());

        let resolver = Arc::new(
            RegistryResolver::from_config(Arc::clone(&provider))
                .context("failed to build registry client")?,
        );
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&docker),
            Arc::clone(&resolver),
            Arc::clone(&provider),
        ));
        let updater = Arc::new(Updater::new(Arc::clone(&docker)));
        let scheduler = Scheduler::new(scanner, updater, provider);

        tracing::info!("orchestrator initialized");
        Ok(Self {
            config_path: None,
            config: shared,
            docker,
            resolver,
            scheduler,
            start_time: Instant::now(),
        })
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> Arc<DockwatchConfig> {
        self.config.snapshot()
    }

    pub fn scheduler(&self) -> &DockerScheduler {
        &self.scheduler
    }

    pub fn resolver(&self) -> &DockerResolver {
        &self.resolver
    }

    /// One scan-and-update, for `--once`.
    pub async fn run_once(&self) -> Result<RunReport> {
        let report = self
            .scheduler
            .run_scan_and_update(&CancellationToken::new())
            .await
            .context("scan and update failed")?;
        tracing::info!(
            scanned = report.scanned,
            update_available = report.update_available,
            updated = report.updated,
            failed = report.failed,
            "single run finished"
        );
        Ok(report)
    }

    /// Starts the scheduler and blocks until a shutdown signal.
    pub async fn run(&self) -> Result<()> {
        if let Err(e) = self.docker.ping().await {
            tracing::warn!(error = %e, "docker daemon not reachable yet, scans will fail until it is");
        }

        self.scheduler.start();
        tracing::info!("entering main loop");

        let signal = self.wait_for_shutdown().await?;
        tracing::info!(signal, "shutdown signal received");

        self.scheduler.stop().await;
        tracing::info!(
            uptime_secs = self.start_time.elapsed().as_secs(),
            "dockwatch-daemon shut down"
        );
        Ok(())
    }

    /// Re-reads the config file and publishes it. Logging settings keep
    /// their startup values; the scheduler restarts when its mode changed.
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            tracing::info!("no config file to reload");
            return Ok(());
        };

        let current = self.config.snapshot();
        let mut next = load_config(path).await?;
        next.general = current.general.clone();

        let schedule_changed = ScheduleMode::from_config(&current.scan)
            != ScheduleMode::from_config(&next.scan)
            || current.scan.initial_scan_on_start != next.scan.initial_scan_on_start;

        self.config.replace(next);
        self.resolver.refresh_credentials();
        tracing::info!(path = %path.display(), "configuration reloaded");

        if schedule_changed && self.scheduler.is_running() {
            tracing::info!("schedule changed, restarting scheduler");
            self.scheduler.stop().await;
            self.scheduler.start();
        }
        Ok(())
    }

    async fn wait_for_shutdown(&self) -> Result<&'static str> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => return Ok("SIGTERM"),
                _ = sigint.recv() => return Ok("SIGINT"),
                _ = sighup.recv() => {
                    if let Err(e) = self.reload().await {
                        tracing::error!(error = %e, "configuration reload failed, keeping previous");
                    }
                }
            }
        }
    }
}
