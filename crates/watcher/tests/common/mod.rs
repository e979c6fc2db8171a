//! Shared fixtures for the watcher integration tests.
//!
//! Each test binary compiles this module on its own and uses a subset of it,
//! so helpers used by only one binary carry `allow(dead_code)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bollard::models::ContainerConfig;
use dockwatch_core::{ConfigProvider, ContainerSnapshot, DockwatchConfig, RegistryAuth, SharedConfig};
use dockwatch_watcher::docker::{
    ContainerDetails, ContainerLister, ContainerMutator, ContainerSpec, ImagePuller,
};
use dockwatch_watcher::registry::reference::ImageCoordinate;
use dockwatch_watcher::registry::{FetchedManifest, ManifestFetcher, RegistryResolver};
use dockwatch_watcher::{RegistryError, Scanner, Updater, WatcherError};

pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub digests: Vec<String>,
    pub labels: HashMap<String, String>,
}

pub fn container(id: &str, name: &str, image: &str, digest: Option<&str>) -> FakeContainer {
    FakeContainer {
        id: id.to_owned(),
        name: name.to_owned(),
        image: image.to_owned(),
        running: true,
        digests: digest.map(|d| vec![d.to_owned()]).unwrap_or_default(),
        labels: HashMap::new(),
    }
}

/// In-memory runtime. Operations named in `failing` always fail.
#[derive(Default)]
pub struct TestRuntime {
    containers: Mutex<Vec<FakeContainer>>,
    failing: Mutex<Vec<&'static str>>,
    log: Mutex<Vec<&'static str>>,
    created: AtomicUsize,
}

impl TestRuntime {
    pub fn with(containers: Vec<FakeContainer>) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.containers.lock().unwrap() = containers;
        Arc::new(runtime)
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().push(op);
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> Vec<FakeContainer> {
        self.containers.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn ops(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    fn enter(&self, op: &'static str) -> Result<(), WatcherError> {
        self.log.lock().unwrap().push(op);
        if self.failing.lock().unwrap().contains(&op) {
            return Err(WatcherError::DockerApi(format!("{op}: connection reset by peer")));
        }
        Ok(())
    }

    fn find<T>(&self, id: &str, f: impl FnOnce(&mut FakeContainer) -> T) -> Result<T, WatcherError> {
        self.containers
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.id == id)
            .map(f)
            .ok_or_else(|| WatcherError::ContainerNotFound(id.to_owned()))
    }
}

impl ContainerLister for TestRuntime {
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerSnapshot>, WatcherError> {
        self.enter("list")?;
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|c| include_stopped || c.running)
            .map(|c| ContainerSnapshot {
                id: c.id,
                name: c.name,
                image: c.image,
                repo_digests: c.digests,
                labels: c.labels,
                state: if c.running { "running" } else { "exited" }.to_owned(),
                ..ContainerSnapshot::default()
            })
            .collect())
    }
}

impl ImagePuller for TestRuntime {
    async fn pull_image(&self, _image: &str) -> Result<(), WatcherError> {
        self.enter("pull")
    }
}

impl ContainerMutator for TestRuntime {
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, WatcherError> {
        self.enter("inspect")?;
        self.find(id, |c| ContainerDetails {
            id: c.id.clone(),
            name: c.name.clone(),
            running: c.running,
            spec: ContainerSpec {
                config: ContainerConfig {
                    image: Some(c.image.clone()),
                    labels: Some(c.labels.clone()),
                    ..ContainerConfig::default()
                },
                ..ContainerSpec::default()
            },
        })
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), WatcherError> {
        self.enter("stop")?;
        self.find(id, |c| c.running = false)
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), WatcherError> {
        self.enter("rename")?;
        self.find(id, |c| c.name = new_name.to_owned())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String, WatcherError> {
        self.enter("create")?;
        let mut containers = self.containers.lock().unwrap();
        if containers.iter().any(|c| c.name == name) {
            return Err(WatcherError::DockerApi(format!("Conflict. The container name \"/{name}\" is already in use")));
        }
        let id = format!("fresh{}", self.created.fetch_add(1, Ordering::SeqCst));
        containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_owned(),
            image: spec.image().to_owned(),
            running: false,
            digests: Vec::new(),
            labels: spec.config.labels.clone().unwrap_or_default(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), WatcherError> {
        self.log.lock().unwrap().push("start");
        // only freshly created containers fail to start; the original can be restarted
        if id.starts_with("fresh") && self.failing.lock().unwrap().contains(&"start") {
            return Err(WatcherError::DockerApi("start: exec format error".to_owned()));
        }
        self.find(id, |c| c.running = true)
    }

    async fn remove_container(&self, id: &str, _force: bool, _remove_volumes: bool) -> Result<(), WatcherError> {
        self.enter("remove")?;
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|c| c.id != id);
        if containers.len() == before {
            return Err(WatcherError::ContainerNotFound(id.to_owned()));
        }
        Ok(())
    }
}

/// Registry stub keyed by `host/repository:tag`.
#[derive(Default)]
pub struct ScriptedRegistry {
    digests: Mutex<HashMap<String, String>>,
    errors: Mutex<HashMap<String, RegistryError>>,
    requests: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
}

#[allow(dead_code)]
impl ScriptedRegistry {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn digest(self, key: &str, digest: &str) -> Self {
        self.set_digest(key, digest);
        self
    }

    pub fn error(self, key: &str, error: RegistryError) -> Self {
        self.errors.lock().unwrap().insert(key.to_owned(), error);
        self
    }

    pub fn set_digest(&self, key: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert(key.to_owned(), digest.to_owned());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, key: &str) -> usize {
        self.requests().iter().filter(|k| *k == key).count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ManifestFetcher for ScriptedRegistry {
    async fn fetch_manifest(
        &self,
        image: &ImageCoordinate,
        _credentials: Option<&RegistryAuth>,
    ) -> Result<FetchedManifest, RegistryError> {
        let key = image.cache_key();
        self.requests.lock().unwrap().push(key.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = self.errors.lock().unwrap().get(&key) {
            return Err(e.clone());
        }
        let digest = self
            .digests
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::Status("404 Not Found".to_owned()))?;
        Ok(FetchedManifest {
            content_type: MANIFEST_V2.to_owned(),
            digest_header: Some(digest),
            body: b"{}".to_vec(),
        })
    }
}

/// Wires a scanner and updater over shared fakes.
pub struct Harness {
    pub runtime: Arc<TestRuntime>,
    #[allow(dead_code)]
    pub resolver: Arc<RegistryResolver<ScriptedRegistry>>,
    pub scanner: Arc<Scanner<TestRuntime, RegistryResolver<ScriptedRegistry>>>,
    #[allow(dead_code)]
    pub updater: Arc<Updater<TestRuntime>>,
    #[allow(dead_code)]
    pub config: Arc<dyn ConfigProvider>,
}

impl Harness {
    pub fn new(containers: Vec<FakeContainer>, registry: ScriptedRegistry, config: DockwatchConfig) -> Self {
        let config: Arc<dyn ConfigProvider> = Arc::new(SharedConfig::new(config));
        let runtime = TestRuntime::with(containers);
        let resolver = Arc::new(RegistryResolver::new(registry, Arc::clone(&config)));
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&runtime),
            Arc::clone(&resolver),
            Arc::clone(&config),
        ));
        let updater = Arc::new(Updater::new(Arc::clone(&runtime)));
        Self {
            runtime,
            resolver,
            scanner,
            updater,
            config,
        }
    }
}
