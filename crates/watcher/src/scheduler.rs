//! Scan-and-update scheduler.
//!
//! `Stopped ⇄ Running`. In cron mode every tick runs a scan followed by
//! serial updates; in interval mode every tick runs a scan only. Runs never
//! overlap: a run requested while another is in progress is skipped and
//! reported as such.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dockwatch_core::config::ScanConfig;
use dockwatch_core::metrics as m;
use dockwatch_core::{ConfigProvider, ContainerStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::docker::{ContainerLister, ContainerMutator, ImagePuller};
use crate::error::WatcherError;
use crate::registry::DigestResolver;
use crate::scanner::{ScanOptions, Scanner};
use crate::updater::Updater;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(300);

/// How the loop is driven; fixed at [`Scheduler::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Six-field cron expression, seconds first
    Cron(String),
    Interval(Duration),
}

impl ScheduleMode {
    pub fn from_config(scan: &ScanConfig) -> Self {
        let expr = scan.cron.trim();
        if expr.is_empty() {
            let secs = if scan.interval_secs == 0 {
                DEFAULT_INTERVAL
            } else {
                Duration::from_secs(scan.interval_secs)
            };
            Self::Interval(secs)
        } else {
            Self::Cron(expr.to_owned())
        }
    }
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron(expr) => write!(f, "cron '{expr}'"),
            Self::Interval(d) => write!(f, "every {}s", d.as_secs()),
        }
    }
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub running: bool,
    pub mode: Option<ScheduleMode>,
    /// Next cron fire time; `None` in interval mode or when stopped
    pub next_run: Option<DateTime<Utc>>,
}

/// Summary of one [`Scheduler::run_scan_and_update`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub scanned: usize,
    pub update_available: usize,
    pub updated: usize,
    pub failed: usize,
    /// Another run was in progress; nothing was done
    pub skipped_run: bool,
}

/// Receives update events. Every method defaults to a no-op.
pub trait UpdateNotifier: Send + Sync + 'static {
    fn updates_available(&self, _statuses: &[ContainerStatus]) {}

    fn update_succeeded(&self, _status: &ContainerStatus) {}

    fn update_failed(&self, _status: &ContainerStatus, _error: &WatcherError) {}
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    mode: ScheduleMode,
}

struct Inner<L, R, D> {
    scanner: Arc<Scanner<L, R>>,
    updater: Arc<Updater<D>>,
    config: Arc<dyn ConfigProvider>,
    notifier: RwLock<Option<Arc<dyn UpdateNotifier>>>,
    run_guard: tokio::sync::Mutex<()>,
}

/// Drives the scanner and updater on a cron schedule or a fixed interval.
pub struct Scheduler<L, R, D> {
    inner: Arc<Inner<L, R, D>>,
    handle: Mutex<Option<RunHandle>>,
}

impl<L, R, D> Scheduler<L, R, D>
where
    L: ContainerLister,
    R: DigestResolver,
    D: ImagePuller + ContainerMutator,
{
    pub fn new(
        scanner: Arc<Scanner<L, R>>,
        updater: Arc<Updater<D>>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                scanner,
                updater,
                config,
                notifier: RwLock::new(None),
                run_guard: tokio::sync::Mutex::new(()),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn UpdateNotifier>) {
        *self.inner.notifier.write().unwrap_or_else(|p| p.into_inner()) = Some(notifier);
    }

    /// Starts the loop from the current configuration. No-op while running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            debug!("scheduler already running");
            return;
        }

        let config = self.inner.config.snapshot();
        let mode = ScheduleMode::from_config(&config.scan);
        let initial_scan = config.scan.initial_scan_on_start;
        let cancel = CancellationToken::new();

        let inner = Arc::clone(&self.inner);
        let loop_cancel = cancel.clone();
        let loop_mode = mode.clone();
        let task = tokio::spawn(async move {
            inner.run_loop(loop_mode, initial_scan, loop_cancel).await;
        });

        info!(mode = %mode, "scheduler started");
        *handle = Some(RunHandle { cancel, task, mode });
    }

    /// Cancels the loop and waits for an in-flight run to finish.
    /// No-op when stopped.
    pub async fn stop(&self) {
        let taken = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(handle) = taken else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    pub fn task_info(&self) -> TaskInfo {
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        let Some(h) = handle.as_ref().filter(|h| !h.task.is_finished()) else {
            return TaskInfo {
                running: false,
                mode: None,
                next_run: None,
            };
        };
        let next_run = match &h.mode {
            ScheduleMode::Cron(expr) => cron::Schedule::from_str(expr)
                .ok()
                .and_then(|s| s.upcoming(Utc).next()),
            ScheduleMode::Interval(_) => None,
        };
        TaskInfo {
            running: true,
            mode: Some(h.mode.clone()),
            next_run,
        }
    }

    /// Scans once, then updates every container that needs it, serially.
    ///
    /// A failing or timed-out update is logged and the next container is
    /// still attempted. Returns `skipped_run` when another run holds the
    /// run guard.
    ///
    /// # Errors
    ///
    /// Only scan failures (listing, cancellation) are returned.
    pub async fn run_scan_and_update(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunReport, WatcherError> {
        self.inner.run_scan_and_update(cancel).await
    }
}

impl<L, R, D> Inner<L, R, D>
where
    L: ContainerLister,
    R: DigestResolver,
    D: ImagePuller + ContainerMutator,
{
    fn notifier(&self) -> Option<Arc<dyn UpdateNotifier>> {
        self.notifier
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn run_loop(&self, mode: ScheduleMode, initial_scan: bool, cancel: CancellationToken) {
        if initial_scan {
            self.run_job(&mode).await;
        }
        match mode {
            ScheduleMode::Cron(expr) => self.cron_loop(&expr, &cancel).await,
            ScheduleMode::Interval(period) => self.interval_loop(period, &cancel).await,
        }
    }

    async fn cron_loop(&self, expr: &str, cancel: &CancellationToken) {
        let schedule = match cron::Schedule::from_str(expr) {
            Ok(s) => s,
            Err(e) => {
                error!(cron = expr, error = %e, "invalid cron expression, scheduler loop exiting");
                return;
            }
        };

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(cron = expr, "cron expression has no upcoming fire time");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, "waiting for next cron tick");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            self.scan_and_update_detached().await;
        }
    }

    async fn run_job(&self, mode: &ScheduleMode) {
        match mode {
            ScheduleMode::Cron(_) => self.scan_and_update_detached().await,
            ScheduleMode::Interval(_) => self.scan_only().await,
        }
    }

    /// Runs to completion even if stop is requested meanwhile.
    async fn scan_and_update_detached(&self) {
        if let Err(e) = self.run_scan_and_update(&CancellationToken::new()).await {
            warn!(error = %e, "scheduled run failed");
        }
    }

    async fn interval_loop(&self, period: Duration, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.scan_only().await,
            }
        }
    }

    /// Interval passes report available updates but never apply them.
    async fn scan_only(&self) {
        let Ok(_guard) = self.run_guard.try_lock() else {
            debug!("run in progress, skipping scan");
            metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "skipped").increment(1);
            return;
        };
        let config = self.config.snapshot();
        match self
            .scanner
            .scan_once(&CancellationToken::new(), ScanOptions::from_config(&config))
            .await
        {
            Ok(statuses) => {
                metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "success").increment(1);
                let available: Vec<ContainerStatus> =
                    statuses.into_iter().filter(ContainerStatus::needs_update).collect();
                if !available.is_empty() {
                    info!(count = available.len(), "updates available");
                    if let Some(n) = self.notifier() {
                        n.updates_available(&available);
                    }
                }
            }
            Err(e) => {
                metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                warn!(error = %e, "scheduled scan failed");
            }
        }
    }

    /// Runs one update under `limit`. On timeout the update is cancelled and
    /// awaited so it can restore the container before we move on.
    async fn update_with_timeout(
        &self,
        cancel: &CancellationToken,
        status: &ContainerStatus,
        limit: Duration,
    ) -> Result<(), WatcherError> {
        let token = cancel.child_token();
        let update = self.updater.update_container(&token, &status.id, &status.image);
        tokio::pin!(update);

        tokio::select! {
            result = &mut update => result,
            _ = tokio::time::sleep(limit) => {
                token.cancel();
                match update.await {
                    Err(WatcherError::Cancelled) => Err(WatcherError::Scheduler(format!(
                        "update timed out after {}s",
                        limit.as_secs()
                    ))),
                    other => other,
                }
            }
        }
    }

    async fn run_scan_and_update(&self, cancel: &CancellationToken) -> Result<RunReport, WatcherError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            info!("previous run still in progress, skipping");
            metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "skipped").increment(1);
            return Ok(RunReport {
                skipped_run: true,
                ..RunReport::default()
            });
        };

        let config = self.config.snapshot();
        let statuses = match self
            .scanner
            .scan_once(cancel, ScanOptions::from_config(&config))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                return Err(e);
            }
        };

        let candidates: Vec<&ContainerStatus> = statuses.iter().filter(|s| s.needs_update()).collect();
        let mut report = RunReport {
            scanned: statuses.len(),
            update_available: candidates.len(),
            ..RunReport::default()
        };
        let notifier = self.notifier();
        if let Some(n) = &notifier {
            if !candidates.is_empty() {
                let owned: Vec<ContainerStatus> = candidates.iter().map(|s| (*s).clone()).collect();
                n.updates_available(&owned);
            }
        }

        if !config.scan.update_enabled {
            info!(update_available = report.update_available, "updates disabled, scan only");
            metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "success").increment(1);
            return Ok(report);
        }

        let per_update = match config.scan.update_timeout_secs {
            0 => DEFAULT_UPDATE_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        for status in candidates {
            if cancel.is_cancelled() {
                info!("run cancelled, remaining updates not attempted");
                break;
            }

            let outcome = self.update_with_timeout(cancel, status, per_update).await;

            match outcome {
                Ok(()) => {
                    report.updated += 1;
                    if let Some(n) = &notifier {
                        n.update_succeeded(status);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(container = %status.name, image = %status.image, error = %e, "update failed, continuing");
                    if let Some(n) = &notifier {
                        n.update_failed(status, &e);
                    }
                }
            }
        }

        metrics::counter!(m::SCHEDULER_RUNS_TOTAL, m::LABEL_RESULT => "success").increment(1);
        info!(
            scanned = report.scanned,
            updated = report.updated,
            failed = report.failed,
            "scan and update finished"
        );
        Ok(report)
    }
}
