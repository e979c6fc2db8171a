//! Container scanner.
//!
//! One [`ContainerStatus`] per listed container, in list order. Policy runs
//! first; skipped containers never reach the registry. Registry failures turn
//! into an `Error` status for that container only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dockwatch_core::metrics as m;
use dockwatch_core::{ConfigProvider, ContainerSnapshot, ContainerStatus, DockwatchConfig, ScanStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::docker::ContainerLister;
use crate::error::WatcherError;
use crate::policy::{self, PolicyInput};
use crate::pool;
use crate::registry::DigestResolver;

/// Worker count when the caller passes zero.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 4;

/// Parameters of one [`Scanner::scan_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub include_stopped: bool,
    /// Worker count, clamped to `[1, 64]`; zero means the default
    pub concurrency: usize,
    pub use_cache: bool,
    /// Full registry lookup; when false only cached index digests are used
    pub resolve_remote: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_stopped: false,
            concurrency: DEFAULT_SCAN_CONCURRENCY,
            use_cache: true,
            resolve_remote: true,
        }
    }
}

impl ScanOptions {
    /// Options the scheduler uses for a configured scan.
    pub fn from_config(config: &DockwatchConfig) -> Self {
        Self {
            include_stopped: config.docker.include_stopped,
            concurrency: config.scan.concurrency,
            use_cache: true,
            resolve_remote: true,
        }
    }
}

/// True iff some local digest's part after the first `@` equals `remote`.
pub fn compare_digests(locals: &[String], remote: &str) -> bool {
    locals
        .iter()
        .filter_map(|local| local.split_once('@').map(|(_, digest)| digest))
        .any(|digest| digest == remote)
}

/// Lists containers and classifies each one.
pub struct Scanner<L, R> {
    docker: Arc<L>,
    resolver: Arc<R>,
    config: Arc<dyn ConfigProvider>,
}

impl<L: ContainerLister, R: DigestResolver> Scanner<L, R> {
    pub fn new(docker: Arc<L>, resolver: Arc<R>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            docker,
            resolver,
            config,
        }
    }

    /// Scans every container once.
    ///
    /// # Errors
    ///
    /// Listing failures abort the scan. `Cancelled` if `cancel` fires before
    /// every container was checked.
    pub async fn scan_once(
        &self,
        cancel: &CancellationToken,
        options: ScanOptions,
    ) -> Result<Vec<ContainerStatus>, WatcherError> {
        let started = Instant::now();
        let config = self.config.snapshot();

        let containers = match self.docker.list_containers(options.include_stopped).await {
            Ok(c) => c,
            Err(e) => {
                metrics::counter!(m::SCANS_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                warn!(error = %e, "container listing failed, scan aborted");
                return Err(e);
            }
        };

        let workers = pool::clamp_concurrency(options.concurrency, DEFAULT_SCAN_CONCURRENCY);
        debug!(containers = containers.len(), workers, "scan started");

        let checked_at = Utc::now();
        let (list, config_ref) = (&containers, config.as_ref());
        let result = pool::map_ordered(cancel, list.len(), workers, move |i| {
            self.check_container(&list[i], config_ref, options, checked_at)
        })
        .await;

        let statuses = match result {
            Ok(s) => s,
            Err(e) => {
                metrics::counter!(m::SCANS_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                info!("scan cancelled");
                return Err(e);
            }
        };

        record_scan(&statuses, started);
        Ok(statuses)
    }

    async fn check_container(
        &self,
        container: &ContainerSnapshot,
        config: &DockwatchConfig,
        options: ScanOptions,
        checked_at: DateTime<Utc>,
    ) -> ContainerStatus {
        let mut status = ContainerStatus::from_snapshot(container, checked_at);

        let decision = policy::evaluate(&PolicyInput::new(
            container,
            &config.policy,
            config.scan.allow_compose_update,
        ));
        if decision.is_skip() {
            status.status = ScanStatus::Skipped;
            status.skipped = true;
            status.skip_reason = decision.reason_str().to_owned();
            debug!(container = %container.name, reason = decision.reason_str(), "skipped");
            return status;
        }

        let remote = if options.resolve_remote {
            self.resolver
                .resolve(&container.image, options.use_cache)
                .await
                .map(|d| d.preferred().to_owned())
        } else {
            self.resolver
                .cached_digest(&container.image)
                .map(Option::unwrap_or_default)
        };

        match remote {
            Ok(remote) => {
                let outdated = container.repo_digests.is_empty()
                    || (!remote.is_empty() && !compare_digests(&container.repo_digests, &remote));
                status.status = if outdated {
                    ScanStatus::UpdateAvailable
                } else {
                    ScanStatus::UpToDate
                };
                status.remote_digest = remote;
            }
            Err(e) => {
                status.status = ScanStatus::Error;
                status.skip_reason = WatcherError::Registry(e).to_string();
                debug!(container = %container.name, reason = %status.skip_reason, "digest lookup failed");
            }
        }
        status
    }
}

fn record_scan(statuses: &[ContainerStatus], started: Instant) {
    let elapsed = started.elapsed();
    metrics::counter!(m::SCANS_TOTAL, m::LABEL_RESULT => "success").increment(1);
    metrics::histogram!(m::SCAN_DURATION_SECONDS).record(elapsed.as_secs_f64());

    let mut by_status: HashMap<ScanStatus, usize> = HashMap::new();
    for s in statuses {
        *by_status.entry(s.status).or_default() += 1;
    }
    for status in [
        ScanStatus::UpToDate,
        ScanStatus::UpdateAvailable,
        ScanStatus::Skipped,
        ScanStatus::Error,
    ] {
        let count = by_status.get(&status).copied().unwrap_or(0);
        metrics::gauge!(m::CONTAINERS_BY_STATUS, m::LABEL_STATUS => status.as_str()).set(count as f64);
    }

    info!(
        containers = statuses.len(),
        update_available = by_status.get(&ScanStatus::UpdateAvailable).copied().unwrap_or(0),
        errors = by_status.get(&ScanStatus::Error).copied().unwrap_or(0),
        elapsed_ms = elapsed.as_millis() as u64,
        "scan completed"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dockwatch_core::SharedConfig;

    use super::*;
    use crate::docker::mock::{MockContainer, MockDocker};
    use crate::error::RegistryError;
    use crate::registry::mock::MockFetcher;
    use crate::registry::RegistryResolver;

    const NGINX_KEY: &str = "registry-1.docker.io/library/nginx:latest";

    fn config() -> Arc<dyn ConfigProvider> {
        Arc::new(SharedConfig::new(DockwatchConfig::default()))
    }

    fn scanner(
        containers: Vec<MockContainer>,
        fetcher: MockFetcher,
    ) -> Scanner<MockDocker, RegistryResolver<MockFetcher>> {
        let config = config();
        let resolver = RegistryResolver::new(fetcher, Arc::clone(&config)).with_architecture("amd64");
        Scanner::new(Arc::new(MockDocker::new(containers)), Arc::new(resolver), config)
    }

    #[test]
    fn compare_digests_contract() {
        let locals = vec!["nginx@sha256:AAA".to_owned(), "mirror/nginx@sha256:BBB".to_owned()];
        assert!(compare_digests(&locals, "sha256:BBB"));
        assert!(!compare_digests(&locals, "sha256:bbb"));
        assert!(!compare_digests(&locals, "sha256:CCC"));
        assert!(!compare_digests(&[], "sha256:AAA"));
        assert!(!compare_digests(&["no-at-sign".to_owned()], "no-at-sign"));
        assert!(compare_digests(&["a@b@c".to_owned()], "b@c"));
    }

    #[tokio::test]
    async fn outdated_digest_reports_update_available() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX_KEY, "sha256:BBB");
        let s = scanner(
            vec![MockContainer::new("c1", "web", "nginx:latest").with_digest("nginx@sha256:AAA")],
            fetcher,
        );

        let out = s.scan_once(&CancellationToken::new(), ScanOptions::default()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, ScanStatus::UpdateAvailable);
        assert_eq!(out[0].remote_digest, "sha256:BBB");
        assert!(out[0].needs_update());
    }

    #[tokio::test]
    async fn matching_digest_is_up_to_date() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX_KEY, "sha256:AAA");
        let s = scanner(
            vec![MockContainer::new("c1", "web", "nginx").with_digest("nginx@sha256:AAA")],
            fetcher,
        );

        let out = s.scan_once(&CancellationToken::new(), ScanOptions::default()).await.unwrap();
        assert_eq!(out[0].status, ScanStatus::UpToDate);
    }

    #[tokio::test]
    async fn skip_label_makes_no_registry_call() {
        let s = scanner(
            vec![MockContainer::new("c1", "web", "nginx")
                .with_digest("nginx@sha256:AAA")
                .with_label("watchdocker.skip", "true")],
            MockFetcher::new(),
        );

        let out = s.scan_once(&CancellationToken::new(), ScanOptions::default()).await.unwrap();
        assert!(out[0].skipped);
        assert_eq!(out[0].status, ScanStatus::Skipped);
        assert_eq!(out[0].skip_reason, "label skip");
        assert_eq!(s.resolver.cache().len(), 0);
    }

    #[tokio::test]
    async fn registry_failure_is_isolated() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX_KEY, "sha256:AAA");
        fetcher.fail(
            "registry-1.docker.io/library/redis:latest",
            RegistryError::Status("500 Internal Server Error".to_owned()),
        );
        let s = scanner(
            vec![
                MockContainer::new("c1", "cache", "redis").with_digest("redis@sha256:R"),
                MockContainer::new("c2", "web", "nginx").with_digest("nginx@sha256:AAA"),
            ],
            fetcher,
        );

        let out = s.scan_once(&CancellationToken::new(), ScanOptions::default()).await.unwrap();
        assert_eq!(out[0].status, ScanStatus::Error);
        assert!(out[0].skip_reason.starts_with("registry: "), "{}", out[0].skip_reason);
        assert!(!out[0].skipped);
        assert_eq!(out[1].status, ScanStatus::UpToDate);
    }

    #[tokio::test]
    async fn forced_container_bypasses_semver_pin() {
        let fetcher = MockFetcher::new();
        fetcher.serve("registry-1.docker.io/library/myapp:1.2.3", "sha256:NEW");
        let s = scanner(
            vec![MockContainer::new("c1", "app", "myapp:1.2.3")
                .with_digest("myapp@sha256:OLD")
                .with_label("watchdocker.force", "true")],
            fetcher,
        );

        let out = s.scan_once(&CancellationToken::new(), ScanOptions::default()).await.unwrap();
        assert_eq!(out[0].status, ScanStatus::UpdateAvailable);
    }

    #[tokio::test]
    async fn cache_only_mode_never_fetches() {
        let s = scanner(
            vec![MockContainer::new("c1", "web", "nginx").with_digest("nginx@sha256:AAA")],
            MockFetcher::new(),
        );
        let options = ScanOptions {
            resolve_remote: false,
            ..ScanOptions::default()
        };

        let out = s.scan_once(&CancellationToken::new(), options).await.unwrap();
        assert_eq!(out[0].status, ScanStatus::UpToDate);
        assert!(out[0].remote_digest.is_empty());
        assert!(s.resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn list_failure_is_fatal() {
        let docker = MockDocker::new(Vec::new());
        docker.fail_on("list");
        let config = config();
        let resolver = RegistryResolver::new(MockFetcher::new(), Arc::clone(&config));
        let s = Scanner::new(Arc::new(docker), Arc::new(resolver), config);

        let err = s
            .scan_once(&CancellationToken::new(), ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WatcherError::DockerApi(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn output_order_matches_listing_at_any_concurrency() {
        let fetcher = MockFetcher::with_latency(Duration::from_millis(3));
        let containers: Vec<MockContainer> = (0..30)
            .map(|i| {
                let image = format!("ghcr.io/org/svc{i}:latest");
                fetcher.serve(&image, &format!("sha256:{i}"));
                MockContainer::new(&format!("c{i}"), &format!("svc{i}"), &image)
                    .with_digest(&format!("ghcr.io/org/svc{i}@sha256:{i}"))
            })
            .collect();
        let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
        let s = scanner(containers, fetcher);

        for concurrency in [1, 2, 7, 64] {
            let options = ScanOptions {
                concurrency,
                use_cache: false,
                ..ScanOptions::default()
            };
            let out = s.scan_once(&CancellationToken::new(), options).await.unwrap();
            let got: Vec<String> = out.iter().map(|st| st.id.clone()).collect();
            assert_eq!(got, ids, "concurrency {concurrency}");
            assert!(out.iter().all(|st| st.status == ScanStatus::UpToDate));
        }
    }

    #[tokio::test]
    async fn cancelled_scan_returns_error() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX_KEY, "sha256:AAA");
        let s = scanner(
            vec![MockContainer::new("c1", "web", "nginx").with_digest("nginx@sha256:AAA")],
            fetcher,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = s.scan_once(&cancel, ScanOptions::default()).await.unwrap_err();
        assert!(matches!(err, WatcherError::Cancelled));
    }
}
