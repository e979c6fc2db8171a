//! Container runtime capabilities.
//!
//! The runtime is split into narrow traits so each component depends only on
//! what it calls: the scanner lists ([`ContainerLister`]), the updater pulls
//! and mutates ([`ImagePuller`], [`ContainerMutator`]).
//! [`BollardDockerClient`] implements all of them against the Docker API.
//!
//! ```text
//!   Scanner ──▶ ContainerLister ─┐
//!                                ├──▶ BollardDockerClient ──▶ Docker daemon
//!   Updater ──▶ ImagePuller      │
//!           └─▶ ContainerMutator ┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};
use dockwatch_core::{ContainerSnapshot, PortMapping};
use futures::StreamExt;
use tracing::debug;

use crate::error::WatcherError;

const MAX_REF_LEN: usize = 128;
const SHORT_ID_LEN: usize = 12;

/// Accepts container ids and names; rejects anything that could escape the
/// API path.
fn validate_container_ref(id: &str) -> Result<(), WatcherError> {
    if id.is_empty() || id.len() > MAX_REF_LEN {
        return Err(WatcherError::DockerApi(format!(
            "invalid container reference: length {} (must be 1-{MAX_REF_LEN})",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(WatcherError::DockerApi(format!(
            "invalid container reference: {id:?}"
        )));
    }
    Ok(())
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Enumerates containers.
pub trait ContainerLister: Send + Sync + 'static {
    /// Lists containers; stopped ones only when `include_stopped`.
    fn list_containers(
        &self,
        include_stopped: bool,
    ) -> impl Future<Output = Result<Vec<ContainerSnapshot>, WatcherError>> + Send;
}

/// Pulls images.
pub trait ImagePuller: Send + Sync + 'static {
    /// Pulls `image` and waits for the pull to finish.
    fn pull_image(&self, image: &str) -> impl Future<Output = Result<(), WatcherError>> + Send;
}

/// Reads and mutates individual containers.
pub trait ContainerMutator: Send + Sync + 'static {
    /// Captures the container's configuration and run state.
    ///
    /// # Errors
    ///
    /// `ContainerNotFound` on 404, `DockerApi` otherwise.
    fn inspect_container(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ContainerDetails, WatcherError>> + Send;

    /// Stops with a grace period of `timeout_secs` before SIGKILL.
    fn stop_container(
        &self,
        id: &str,
        timeout_secs: i64,
    ) -> impl Future<Output = Result<(), WatcherError>> + Send;

    fn rename_container(
        &self,
        id: &str,
        new_name: &str,
    ) -> impl Future<Output = Result<(), WatcherError>> + Send;

    /// Creates a container named `name` from `spec`. Returns the new id.
    fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<String, WatcherError>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<(), WatcherError>> + Send;

    fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> impl Future<Output = Result<(), WatcherError>> + Send;
}

/// Everything needed to recreate a container: config, host config and
/// network endpoints.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub config: ContainerConfig,
    pub host_config: Option<HostConfig>,
    pub endpoints: HashMap<String, EndpointSettings>,
}

impl ContainerSpec {
    pub fn image(&self) -> &str {
        self.config.image.as_deref().unwrap_or_default()
    }

    /// Same spec with the image replaced.
    pub fn with_image(&self, image: &str) -> Self {
        let mut spec = self.clone();
        spec.config.image = Some(image.to_owned());
        spec
    }
}

/// Result of [`ContainerMutator::inspect_container`].
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    /// Name without the leading `/`
    pub name: String,
    pub running: bool,
    pub spec: ContainerSpec,
}

/// Docker API client backed by bollard.
#[derive(Clone)]
pub struct BollardDockerClient {
    docker: Arc<bollard::Docker>,
}

impl BollardDockerClient {
    /// Connects using the platform's default socket.
    pub fn connect_local() -> Result<Self, WatcherError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            WatcherError::DockerConnection(format!("failed to connect to docker: {e}"))
        })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    pub fn connect_with_socket(socket_path: &str) -> Result<Self, WatcherError> {
        let docker =
            bollard::Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    WatcherError::DockerConnection(format!(
                        "failed to connect to docker at {socket_path}: {e}"
                    ))
                })?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Empty `socket` means the platform default.
    pub fn connect(socket: &str) -> Result<Self, WatcherError> {
        if socket.is_empty() {
            Self::connect_local()
        } else {
            Self::connect_with_socket(socket)
        }
    }

    pub async fn ping(&self) -> Result<(), WatcherError> {
        self.docker
            .ping()
            .await
            .map_err(|e| WatcherError::DockerConnection(format!("ping failed: {e}")))?;
        Ok(())
    }

    async fn repo_digests(&self, image_id: &str) -> Vec<String> {
        match self.docker.inspect_image(image_id).await {
            Ok(image) => image.repo_digests.unwrap_or_default(),
            Err(e) => {
                debug!(image_id, error = %e, "image inspect failed, no local digests");
                Vec::new()
            }
        }
    }

    async fn started_at(&self, id: &str) -> String {
        match self.docker.inspect_container(id, None).await {
            Ok(details) => details
                .state
                .and_then(|s| s.started_at)
                .unwrap_or_default(),
            Err(e) => {
                debug!(container_id = id, error = %e, "container inspect failed");
                String::new()
            }
        }
    }
}

impl ContainerLister for BollardDockerClient {
    async fn list_containers(
        &self,
        include_stopped: bool,
    ) -> Result<Vec<ContainerSnapshot>, WatcherError> {
        use bollard::container::ListContainersOptions;

        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| WatcherError::DockerApi(format!("list containers failed: {e}")))?;

        let mut digests_by_image: HashMap<String, Vec<String>> = HashMap::new();
        let mut result = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container.id.unwrap_or_default();
            let name = container
                .names
                .unwrap_or_default()
                .first()
                .map(|n| n.trim_start_matches('/').to_owned())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| id.chars().take(SHORT_ID_LEN).collect());

            let image_id = container.image_id.unwrap_or_default();
            let repo_digests = match digests_by_image.get(&image_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.repo_digests(&image_id).await;
                    digests_by_image.insert(image_id, fetched.clone());
                    fetched
                }
            };

            let ports = container
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| PortMapping {
                    ip: p.ip.unwrap_or_default(),
                    private_port: p.private_port,
                    public_port: p.public_port,
                    protocol: p.typ.map(|t| t.to_string()).unwrap_or_default(),
                })
                .collect();

            let started_at = self.started_at(&id).await;
            result.push(ContainerSnapshot {
                id,
                name,
                image: container.image.unwrap_or_default(),
                repo_digests,
                labels: container.labels.unwrap_or_default(),
                state: container.state.unwrap_or_default(),
                started_at,
                ports,
            });
        }

        Ok(result)
    }
}

impl ImagePuller for BollardDockerClient {
    async fn pull_image(&self, image: &str) -> Result<(), WatcherError> {
        use bollard::image::CreateImageOptions;

        let (from_image, tag) = split_pull_reference(image);
        let options = CreateImageOptions::<String> {
            from_image,
            tag,
            ..Default::default()
        };

        let mut progress = std::pin::pin!(self.docker.create_image(Some(options), None, None));
        while let Some(item) = progress.next().await {
            let info =
                item.map_err(|e| WatcherError::DockerApi(format!("pull {image} failed: {e}")))?;
            if let Some(error) = info.error {
                return Err(WatcherError::DockerApi(format!("pull {image} failed: {error}")));
            }
        }
        Ok(())
    }
}

impl ContainerMutator for BollardDockerClient {
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, WatcherError> {
        validate_container_ref(id)?;

        let details = self.docker.inspect_container(id, None).await.map_err(|e| {
            if is_not_found(&e) {
                WatcherError::ContainerNotFound(id.to_owned())
            } else {
                WatcherError::DockerApi(format!("inspect container failed: {e}"))
            }
        })?;

        let container_id = details.id.unwrap_or_default();
        let endpoints = details
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(network, endpoint)| (network, reusable_endpoint(endpoint, &container_id)))
            .collect();

        Ok(ContainerDetails {
            name: details
                .name
                .map(|n| n.trim_start_matches('/').to_owned())
                .unwrap_or_default(),
            running: details.state.and_then(|s| s.running).unwrap_or(false),
            spec: ContainerSpec {
                config: details.config.unwrap_or_default(),
                host_config: details.host_config,
                endpoints,
            },
            id: container_id,
        })
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), WatcherError> {
        validate_container_ref(id)?;
        use bollard::container::StopContainerOptions;

        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| WatcherError::DockerApi(format!("stop {id} failed: {e}")))
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), WatcherError> {
        validate_container_ref(id)?;
        validate_container_ref(new_name)?;
        use bollard::container::RenameContainerOptions;

        self.docker
            .rename_container(
                id,
                RenameContainerOptions {
                    name: new_name.to_owned(),
                },
            )
            .await
            .map_err(|e| WatcherError::DockerApi(format!("rename {id} to {new_name} failed: {e}")))
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, WatcherError> {
        validate_container_ref(name)?;
        use bollard::container::{Config, CreateContainerOptions, NetworkingConfig};

        let mut config = Config::<String>::from(spec.config.clone());
        config.host_config = spec.host_config.clone();
        if !spec.endpoints.is_empty() {
            config.networking_config = Some(NetworkingConfig {
                endpoints_config: spec.endpoints.clone(),
            });
        }

        let options = CreateContainerOptions {
            name: name.to_owned(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| WatcherError::DockerApi(format!("create {name} failed: {e}")))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), WatcherError> {
        validate_container_ref(id)?;
        use bollard::container::StartContainerOptions;

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| WatcherError::DockerApi(format!("start {id} failed: {e}")))
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), WatcherError> {
        validate_container_ref(id)?;
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: remove_volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    WatcherError::ContainerNotFound(id.to_owned())
                } else {
                    WatcherError::DockerApi(format!("remove {id} failed: {e}"))
                }
            })
    }
}

/// Splits `repo[:tag][@digest]` into the `fromImage`/`tag` pull parameters.
///
/// Digest references are passed whole with an empty tag; a missing tag
/// becomes `latest` so the daemon never pulls every tag.
fn split_pull_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_owned(), String::new());
    }
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(colon) => {
            let split = last_slash + colon;
            (image[..split].to_owned(), image[split + 1..].to_owned())
        }
        None => (image.to_owned(), "latest".to_owned()),
    }
}

/// Keeps the user-supplied parts of an endpoint; runtime-assigned ids and
/// addresses belong to the old container.
fn reusable_endpoint(endpoint: EndpointSettings, container_id: &str) -> EndpointSettings {
    let short_id: String = container_id.chars().take(SHORT_ID_LEN).collect();
    let aliases = endpoint.aliases.map(|aliases| {
        aliases
            .into_iter()
            .filter(|a| *a != short_id && *a != container_id)
            .collect::<Vec<_>>()
    });
    EndpointSettings {
        aliases: aliases.filter(|a| !a.is_empty()),
        links: endpoint.links,
        ipam_config: endpoint.ipam_config,
        driver_opts: endpoint.driver_opts,
        ..Default::default()
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockContainer, MockDocker};
    use super::*;

    #[test]
    fn container_ref_validation() {
        assert!(validate_container_ref("abc123def456").is_ok());
        assert!(validate_container_ref("web-1.old_2").is_ok());
        assert!(validate_container_ref("").is_err());
        assert!(validate_container_ref("../etc").is_err());
        assert!(validate_container_ref("a b").is_err());
        assert!(validate_container_ref(&"a".repeat(MAX_REF_LEN + 1)).is_err());
    }

    #[test]
    fn pull_reference_split() {
        assert_eq!(
            split_pull_reference("nginx"),
            ("nginx".to_owned(), "latest".to_owned())
        );
        assert_eq!(
            split_pull_reference("localhost:5000/app:v2"),
            ("localhost:5000/app".to_owned(), "v2".to_owned())
        );
        assert_eq!(
            split_pull_reference("localhost:5000/app"),
            ("localhost:5000/app".to_owned(), "latest".to_owned())
        );
        assert_eq!(
            split_pull_reference("nginx@sha256:abc"),
            ("nginx@sha256:abc".to_owned(), String::new())
        );
    }

    #[test]
    fn endpoint_drops_runtime_fields_and_own_alias() {
        let endpoint = EndpointSettings {
            aliases: Some(vec!["abcdef123456".to_owned(), "web".to_owned()]),
            network_id: Some("net".to_owned()),
            endpoint_id: Some("ep".to_owned()),
            ip_address: Some("172.18.0.2".to_owned()),
            ..Default::default()
        };
        let reused = reusable_endpoint(endpoint, "abcdef123456789");
        assert_eq!(reused.aliases, Some(vec!["web".to_owned()]));
        assert!(reused.network_id.is_none());
        assert!(reused.endpoint_id.is_none());
        assert!(reused.ip_address.is_none());
    }

    #[test]
    fn spec_with_image_replaces_only_image() {
        let spec = ContainerSpec {
            config: ContainerConfig {
                image: Some("nginx:1.25".to_owned()),
                env: Some(vec!["A=1".to_owned()]),
                ..Default::default()
            },
            ..Default::default()
        };
        let next = spec.with_image("nginx:1.26");
        assert_eq!(next.image(), "nginx:1.26");
        assert_eq!(next.config.env, spec.config.env);
        assert_eq!(spec.image(), "nginx:1.25");
    }

    #[tokio::test]
    async fn mock_list_filters_stopped() {
        let docker = MockDocker::new(vec![
            MockContainer::new("a1", "web", "nginx"),
            MockContainer::new("b2", "db", "postgres").stopped(),
        ]);
        assert_eq!(docker.list_containers(false).await.unwrap().len(), 1);
        assert_eq!(docker.list_containers(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mock_enforces_unique_names() {
        let docker = MockDocker::new(vec![MockContainer::new("a1", "web", "nginx")]);
        let spec = ContainerSpec::default().with_image("nginx");
        assert!(docker.create_container("web", &spec).await.is_err());
        docker.rename_container("a1", "web-old").await.unwrap();
        assert!(docker.create_container("web", &spec).await.is_ok());
    }

    #[tokio::test]
    async fn mock_failure_budget() {
        let docker = MockDocker::new(vec![MockContainer::new("a1", "web", "nginx")]);
        docker.fail_times("start", 1);
        assert!(docker.start_container("a1").await.is_err());
        assert!(docker.start_container("a1").await.is_ok());
        assert!(docker.called("start"));
    }
}
