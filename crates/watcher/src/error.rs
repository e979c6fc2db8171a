//! Watcher error types.
//!
//! [`WatcherError`] covers runtime, registry, update and scheduler failures.
//! Registry failures are per-reference values ([`RegistryError`]) and never
//! abort a batch; update failures carry the stage that failed
//! ([`UpdateError`]) so callers can classify them without string matching.

use std::fmt;

/// Watcher domain error
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// Docker API call failed
    #[error("docker api error: {0}")]
    DockerApi(String),

    /// Docker daemon unreachable
    #[error("docker connection error: {0}")]
    DockerConnection(String),

    /// Container does not exist
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Remote digest resolution failed
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    /// A stage of a container update failed
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Scheduler could not be configured or started
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The operation's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid argument or configuration value
    #[error("config error: {field}: {reason}")]
    Config {
        /// Field name
        field: String,
        /// Reason
        reason: String,
    },
}

/// Per-reference registry failure.
///
/// Cloneable so one failed fetch can be reported for every reference that
/// normalizes to the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("registry error: {0}")]
    Status(String),

    #[error("bearer token: {0}")]
    Auth(String),

    #[error("decode manifest: {0}")]
    ManifestParse(String),

    #[error("no manifests in index")]
    NoManifests,

    #[error("empty digest")]
    EmptyDigest,

    #[error("resolution cancelled")]
    Cancelled,
}

/// Stage of [`crate::Updater::update_container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    Pull,
    Inspect,
    Stop,
    Create,
    StartNew,
}

impl UpdateStage {
    /// Message prefix used when the stage fails.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Inspect => "inspect",
            Self::Stop => "stop",
            Self::Create => "create",
            Self::StartNew => "start new",
        }
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Failure of one update stage, rendered as `<stage>: <cause>`.
#[derive(Debug, thiserror::Error)]
#[error("{}: {source}", .stage.prefix())]
pub struct UpdateError {
    stage: UpdateStage,
    source: Box<WatcherError>,
}

impl UpdateError {
    pub fn new(stage: UpdateStage, source: WatcherError) -> Self {
        Self {
            stage,
            source: Box::new(source),
        }
    }

    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    /// The underlying runtime error.
    pub fn cause(&self) -> &WatcherError {
        &self.source
    }
}

impl WatcherError {
    /// Stage of a failed update, if this is one.
    pub fn update_stage(&self) -> Option<UpdateStage> {
        match self {
            Self::Update(e) => Some(e.stage()),
            _ => None,
        }
    }
}
