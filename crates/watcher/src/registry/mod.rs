//! Remote digest resolution.
//!
//! [`RegistryResolver`] normalizes references, consults the TTL cache,
//! coalesces concurrent fetches of the same key, and fans batch lookups out
//! over a bounded number of in-flight requests. Failures are reported per
//! reference and never abort a batch.

pub mod cache;
pub mod http;
pub mod manifest;
pub mod reference;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dockwatch_core::config::MAX_CONCURRENCY;
use dockwatch_core::metrics as m;
use dockwatch_core::{ConfigProvider, RegistryAuth};
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::keyed::KeyedLocks;

pub use cache::DigestCache;
pub use http::{HttpManifestFetcher, ManifestFetcher};
pub use manifest::{FetchedManifest, RemoteDigest};
pub use reference::{ImageCoordinate, normalize, normalize_registry_host};

/// Outcome of resolving one reference.
pub type DigestResult = Result<RemoteDigest, RegistryError>;

/// Hosts whose configured credentials are attached to batch lookups.
pub const BATCH_CREDENTIAL_HOSTS: [&str; 2] = [reference::DOCKER_HUB_API_HOST, "ghcr.io"];

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_BATCH_CONCURRENCY: usize = 3;
const PLATFORM_OS: &str = "linux";

/// Digest lookups used by the scanner.
pub trait DigestResolver: Send + Sync + 'static {
    /// Resolves a reference, reading and populating the cache when `use_cache`.
    fn resolve(&self, reference: &str, use_cache: bool) -> impl Future<Output = DigestResult> + Send;

    /// Cache-only lookup. `Ok(None)` on a miss or expired entry.
    fn cached_digest(&self, reference: &str) -> Result<Option<String>, RegistryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialScope {
    AnyHost,
    BatchHosts,
}

/// Registry digest resolver with a shared cache and per-key fetch coalescing.
pub struct RegistryResolver<F> {
    fetcher: F,
    config: Arc<dyn ConfigProvider>,
    cache: DigestCache,
    credentials: RwLock<HashMap<String, RegistryAuth>>,
    inflight: KeyedLocks,
    architecture: String,
}

impl RegistryResolver<HttpManifestFetcher> {
    /// Resolver backed by the HTTP fetcher built from the current snapshot.
    pub fn from_config(config: Arc<dyn ConfigProvider>) -> Result<Self, RegistryError> {
        let fetcher = HttpManifestFetcher::new(&config.snapshot().registry)?;
        Ok(Self::new(fetcher, config))
    }
}

impl<F: ManifestFetcher> RegistryResolver<F> {
    pub fn new(fetcher: F, config: Arc<dyn ConfigProvider>) -> Self {
        let resolver = Self {
            fetcher,
            config,
            cache: DigestCache::new(),
            credentials: RwLock::new(HashMap::new()),
            inflight: KeyedLocks::new(),
            architecture: manifest::host_architecture().to_owned(),
        };
        resolver.refresh_credentials();
        resolver
    }

    /// Overrides the platform architecture used to pick index children.
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn cache(&self) -> &DigestCache {
        &self.cache
    }

    /// Replaces the credential set. Entries with an empty host are ignored.
    pub fn set_credentials(&self, auth: &[RegistryAuth]) {
        let map: HashMap<String, RegistryAuth> = auth
            .iter()
            .filter(|a| !a.host.trim().is_empty())
            .map(|a| {
                let host = normalize_registry_host(&a.host);
                let entry = RegistryAuth {
                    host: host.clone(),
                    username: a.username.clone(),
                    token: a.token.clone(),
                };
                (host, entry)
            })
            .collect();

        let count = map.len();
        *self.credentials.write().unwrap_or_else(|p| p.into_inner()) = map;
        debug!(hosts = count, "registry credentials updated");
    }

    /// Reloads credentials from the current configuration snapshot.
    pub fn refresh_credentials(&self) {
        let snapshot = self.config.snapshot();
        self.set_credentials(&snapshot.registry.auth);
    }

    /// Resolves many references with at most `concurrency` fetches in flight.
    ///
    /// `concurrency == 0` uses the configured scan concurrency. References
    /// that normalize to the same key are fetched once. Every input gets an
    /// entry in the returned map.
    pub async fn get_remote_digests_batch(
        &self,
        cancel: &CancellationToken,
        references: &[String],
        use_cache: bool,
        concurrency: usize,
    ) -> HashMap<String, DigestResult> {
        let mut results: HashMap<String, DigestResult> = HashMap::with_capacity(references.len());
        let mut pending: HashMap<String, (ImageCoordinate, Vec<String>)> = HashMap::new();

        for reference in references {
            if results.contains_key(reference) {
                continue;
            }
            let image = match normalize(reference) {
                Ok(image) => image,
                Err(e) => {
                    results.insert(reference.clone(), Err(e));
                    continue;
                }
            };
            let key = image.cache_key();
            if use_cache {
                if let Some(digest) = self.cache_hit(&key) {
                    results.insert(reference.clone(), Ok(RemoteDigest::cached(digest)));
                    continue;
                }
            }
            let slot = pending.entry(key).or_insert_with(|| (image, Vec::new()));
            if !slot.1.contains(reference) {
                slot.1.push(reference.clone());
            }
        }

        let width = self.effective_concurrency(concurrency);
        debug!(
            references = references.len(),
            fetches = pending.len(),
            concurrency = width,
            "resolving remote digests"
        );

        let fetched: Vec<(Vec<String>, DigestResult)> = stream::iter(pending.into_values())
            .map(|(image, refs)| async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RegistryError::Cancelled),
                    r = self.resolve_image(&image, use_cache, CredentialScope::BatchHosts) => r,
                };
                (refs, outcome)
            })
            .buffer_unordered(width)
            .collect()
            .await;

        for (refs, outcome) in fetched {
            for reference in refs {
                results.insert(reference, outcome.clone());
            }
        }
        results
    }

    fn effective_concurrency(&self, requested: usize) -> usize {
        let n = if requested == 0 {
            match self.config.snapshot().scan.concurrency {
                0 => DEFAULT_BATCH_CONCURRENCY,
                configured => configured,
            }
        } else {
            requested
        };
        n.clamp(1, MAX_CONCURRENCY)
    }

    fn cache_ttl(&self) -> Duration {
        match self.config.snapshot().scan.cache_ttl_secs {
            0 => DEFAULT_CACHE_TTL,
            secs => Duration::from_secs(secs),
        }
    }

    fn cache_hit(&self, key: &str) -> Option<String> {
        let hit = self.cache.get(key);
        if hit.is_some() {
            metrics::counter!(m::REGISTRY_CACHE_HITS_TOTAL).increment(1);
        }
        hit
    }

    fn credentials_for(&self, host: &str, scope: CredentialScope) -> Option<RegistryAuth> {
        if scope == CredentialScope::BatchHosts && !BATCH_CREDENTIAL_HOSTS.contains(&host) {
            return None;
        }
        self.credentials
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(host)
            .cloned()
    }

    async fn resolve_image(
        &self,
        image: &ImageCoordinate,
        use_cache: bool,
        scope: CredentialScope,
    ) -> DigestResult {
        let key = image.cache_key();
        if use_cache {
            if let Some(digest) = self.cache_hit(&key) {
                return Ok(RemoteDigest::cached(digest));
            }
        }

        let gate = self.inflight.handle(&key);
        let (_held, waited_since) = match gate.try_lock() {
            Some(held) => (held, None),
            None => {
                let since = Instant::now();
                (gate.lock().await, Some(since))
            }
        };
        // Only a fetch that finished while we waited may answer for us.
        if let Some(since) = waited_since {
            if let Some(digest) = self.cache.get_stored_since(&key, since) {
                metrics::counter!(m::REGISTRY_CACHE_HITS_TOTAL).increment(1);
                return Ok(RemoteDigest::cached(digest));
            }
        }
        self.fetch(image, &key, scope).await
    }

    async fn fetch(&self, image: &ImageCoordinate, key: &str, scope: CredentialScope) -> DigestResult {
        let credentials = self.credentials_for(&image.host, scope);
        let outcome = self
            .fetcher
            .fetch_manifest(image, credentials.as_ref())
            .await
            .and_then(|fetched| {
                manifest::resolve_digests(&fetched, PLATFORM_OS, &self.architecture)
            })
            .and_then(|digest| {
                if digest.preferred().is_empty() {
                    Err(RegistryError::EmptyDigest)
                } else {
                    Ok(digest)
                }
            });

        match &outcome {
            Ok(digest) => {
                metrics::counter!(m::REGISTRY_REQUESTS_TOTAL, m::LABEL_RESULT => "success")
                    .increment(1);
                if !digest.index_digest.is_empty() {
                    self.cache
                        .insert(key, digest.index_digest.clone(), self.cache_ttl());
                }
            }
            Err(e) => {
                metrics::counter!(m::REGISTRY_REQUESTS_TOTAL, m::LABEL_RESULT => "failure")
                    .increment(1);
                info!(image = %image, error = %e, "remote digest lookup failed");
            }
        }
        outcome
    }

}

impl<F: ManifestFetcher> DigestResolver for RegistryResolver<F> {
    async fn resolve(&self, reference: &str, use_cache: bool) -> DigestResult {
        let image = normalize(reference)?;
        self.resolve_image(&image, use_cache, CredentialScope::AnyHost)
            .await
    }

    fn cached_digest(&self, reference: &str) -> Result<Option<String>, RegistryError> {
        let image = normalize(reference)?;
        Ok(self.cache_hit(&image.cache_key()))
    }
}


#[cfg(test)]
mod tests {
    use dockwatch_core::{DockwatchConfig, SharedConfig};

    use super::mock::MockFetcher;
    use super::*;

    const NGINX: &str = "registry-1.docker.io/library/nginx:latest";

    fn config() -> Arc<dyn ConfigProvider> {
        Arc::new(SharedConfig::new(DockwatchConfig::default()))
    }

    fn resolver(fetcher: MockFetcher) -> RegistryResolver<MockFetcher> {
        RegistryResolver::new(fetcher, config()).with_architecture("amd64")
    }

    #[tokio::test]
    async fn resolve_fetches_and_caches() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        let d = r.resolve("nginx", true).await.unwrap();
        assert_eq!(d.index_digest, "sha256:n1");
        assert_eq!(d.child_digest, "sha256:n1");

        let d = r.resolve("docker.io/library/nginx:latest", true).await.unwrap();
        assert_eq!(d.index_digest, "sha256:n1");
        assert!(d.child_digest.is_empty());
        assert_eq!(r.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn resolve_without_cache_always_fetches() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        r.resolve("nginx", false).await.unwrap();
        r.resolve("nginx", false).await.unwrap();
        assert_eq!(r.fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_resolves_never_reuse_an_earlier_fetch() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        assert_eq!(r.resolve("nginx", false).await.unwrap().index_digest, "sha256:n1");
        r.fetcher.serve(NGINX, "sha256:n2");
        assert_eq!(r.resolve("nginx", false).await.unwrap().index_digest, "sha256:n2");
        assert_eq!(r.fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_resolve_releases_its_gate() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        let holder = r.inflight.handle(NGINX);
        let held = holder.lock().await;
        let timed_out = tokio::time::timeout(Duration::from_millis(10), r.resolve("nginx", false)).await;
        assert!(timed_out.is_err());

        drop(held);
        drop(holder);
        assert!(r.inflight.is_empty());
        assert_eq!(r.resolve("nginx", false).await.unwrap().index_digest, "sha256:n1");
        assert!(r.inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_fetch_releases_its_gate() {
        let fetcher = MockFetcher::with_latency(Duration::from_secs(1));
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), r.resolve("nginx", true)).await;
        assert!(timed_out.is_err());
        assert!(r.inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entry_expires_after_ttl() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        r.resolve("nginx", true).await.unwrap();
        assert_eq!(r.cached_digest("nginx").unwrap().as_deref(), Some("sha256:n1"));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(r.cached_digest("nginx").unwrap(), None);

        r.resolve("nginx", true).await.unwrap();
        assert_eq!(r.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn cached_digest_miss_is_not_an_error() {
        let r = resolver(MockFetcher::new());
        assert_eq!(r.cached_digest("nginx:1.25").unwrap(), None);
        assert!(matches!(
            r.cached_digest("Bad:Ref"),
            Err(RegistryError::InvalidReference { .. })
        ));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let fetcher = MockFetcher::new();
        fetcher.fail(NGINX, RegistryError::Status("500 Internal Server Error".to_owned()));
        let r = resolver(fetcher);

        assert!(r.resolve("nginx", true).await.is_err());
        assert!(r.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_share_one_fetch() {
        let fetcher = MockFetcher::with_latency(Duration::from_millis(100));
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);

        let (a, b, c) = tokio::join!(
            r.resolve("nginx", true),
            r.resolve("nginx:latest", true),
            r.resolve("docker.io/library/nginx", true),
        );
        assert_eq!(a.unwrap().index_digest, "sha256:n1");
        assert_eq!(b.unwrap().index_digest, "sha256:n1");
        assert_eq!(c.unwrap().index_digest, "sha256:n1");
        assert_eq!(r.fetcher.calls(), 1);
        assert!(r.inflight.is_empty());
    }

    #[tokio::test]
    async fn batch_reports_every_reference() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        fetcher.serve("ghcr.io/org/app:v1", "sha256:g1");
        let r = resolver(fetcher);

        let refs: Vec<String> = ["nginx", "nginx:latest", "ghcr.io/org/app:v1", "Bad:Ref", "missing/image:1"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        let out = r
            .get_remote_digests_batch(&CancellationToken::new(), &refs, true, 4)
            .await;

        assert_eq!(out.len(), refs.len());
        assert_eq!(out["nginx"].as_ref().unwrap().index_digest, "sha256:n1");
        assert_eq!(out["nginx:latest"].as_ref().unwrap().index_digest, "sha256:n1");
        assert_eq!(out["ghcr.io/org/app:v1"].as_ref().unwrap().child_digest, "sha256:g1");
        assert!(matches!(out["Bad:Ref"], Err(RegistryError::InvalidReference { .. })));
        assert!(matches!(out["missing/image:1"], Err(RegistryError::Status(_))));
        // nginx and nginx:latest share a key
        assert_eq!(r.fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_respects_concurrency_bound() {
        let fetcher = MockFetcher::with_latency(Duration::from_millis(50));
        let refs: Vec<String> = (0..20).map(|i| format!("ghcr.io/org/app{i}:v1")).collect();
        for reference in &refs {
            fetcher.serve(reference, &format!("sha256:{reference}"));
        }
        let r = resolver(fetcher);

        let out = r
            .get_remote_digests_batch(&CancellationToken::new(), &refs, false, 3)
            .await;
        assert_eq!(out.len(), 20);
        assert!(out.values().all(Result::is_ok));
        assert!(r.fetcher.max_in_flight() <= 3);
        assert!(r.fetcher.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn batch_concurrency_is_clamped() {
        let r = resolver(MockFetcher::new());
        assert_eq!(r.effective_concurrency(0), 3);
        assert_eq!(r.effective_concurrency(1000), MAX_CONCURRENCY);
        assert_eq!(r.effective_concurrency(7), 7);
    }

    #[tokio::test]
    async fn batch_attaches_credentials_only_for_known_hosts() {
        let fetcher = MockFetcher::new();
        fetcher.serve(NGINX, "sha256:n1");
        fetcher.serve("quay.io/org/app:latest", "sha256:q1");
        let r = resolver(fetcher);
        r.set_credentials(&[
            RegistryAuth {
                host: "docker.io".to_owned(),
                username: "hub-user".to_owned(),
                token: "t1".to_owned(),
            },
            RegistryAuth {
                host: "quay.io".to_owned(),
                username: "quay-user".to_owned(),
                token: "t2".to_owned(),
            },
        ]);

        let refs = vec!["nginx".to_owned(), "quay.io/org/app".to_owned()];
        r.get_remote_digests_batch(&CancellationToken::new(), &refs, false, 2)
            .await;
        let mut seen = r.fetcher.seen_credentials();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("quay.io".to_owned(), None),
                (reference::DOCKER_HUB_API_HOST.to_owned(), Some("hub-user".to_owned())),
            ]
        );

        // single lookups use any configured host
        r.resolve("quay.io/org/app", false).await.unwrap();
        let seen = r.fetcher.seen_credentials();
        assert_eq!(seen.last().unwrap().1.as_deref(), Some("quay-user"));
    }

    #[tokio::test]
    async fn refresh_credentials_reads_snapshot() {
        let shared = SharedConfig::new(DockwatchConfig::default());
        let r = RegistryResolver::new(MockFetcher::new(), Arc::new(shared.clone()));
        assert!(r.credentials_for("ghcr.io", CredentialScope::AnyHost).is_none());

        let mut updated = DockwatchConfig::default();
        updated.registry.auth.push(RegistryAuth {
            host: "ghcr.io".to_owned(),
            username: "bot".to_owned(),
            token: "secret".to_owned(),
        });
        shared.replace(updated);
        assert!(r.credentials_for("ghcr.io", CredentialScope::AnyHost).is_none());

        r.refresh_credentials();
        let creds = r.credentials_for("ghcr.io", CredentialScope::AnyHost).unwrap();
        assert_eq!(creds.username, "bot");
    }

    #[tokio::test]
    async fn cancelled_batch_marks_pending_references() {
        let fetcher = MockFetcher::with_latency(Duration::from_secs(60));
        fetcher.serve(NGINX, "sha256:n1");
        let r = resolver(fetcher);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let refs = vec!["nginx".to_owned()];
        let out = r.get_remote_digests_batch(&cancel, &refs, true, 1).await;
        assert_eq!(out["nginx"], Err(RegistryError::Cancelled));
    }
}
