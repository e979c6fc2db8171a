//! CLI error type and exit codes.

use dockwatch_core::DockwatchError;
use dockwatch_watcher::{UpdateStage, WatcherError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// Docker daemon not reachable or rejected the request.
    #[error("docker error: {0}")]
    Docker(String),

    /// Registry or scan failure.
    #[error("scan error: {0}")]
    Scan(String),

    /// A container update failed at `stage`.
    #[error("update failed: {message}")]
    Update {
        stage: Option<UpdateStage>,
        message: String,
    },

    #[error("{0}")]
    Command(String),

    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// | Code | Meaning                    |
    /// |------|----------------------------|
    /// | 1    | General / command error    |
    /// | 2    | Configuration error        |
    /// | 3    | Docker unreachable         |
    /// | 4    | Scan failed                |
    /// | 5    | Update failed              |
    /// | 10   | IO error                   |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Docker(_) => 3,
            Self::Scan(_) => 4,
            Self::Update { .. } => 5,
            Self::Io(_) => 10,
            Self::Command(_) | Self::JsonSerialize(_) => 1,
        }
    }
}

impl From<DockwatchError> for CliError {
    fn from(e: DockwatchError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<WatcherError> for CliError {
    fn from(e: WatcherError) -> Self {
        match &e {
            WatcherError::Update(u) => Self::Update {
                stage: Some(u.stage()),
                message: e.to_string(),
            },
            WatcherError::DockerApi(_)
            | WatcherError::DockerConnection(_)
            | WatcherError::ContainerNotFound(_) => Self::Docker(e.to_string()),
            WatcherError::Config { .. } => Self::Config(e.to_string()),
            _ => Self::Scan(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use dockwatch_watcher::UpdateError;

    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(CliError::Config("x".to_owned()).exit_code(), 2);
        assert_eq!(CliError::Docker("x".to_owned()).exit_code(), 3);
        assert_eq!(CliError::Scan("x".to_owned()).exit_code(), 4);
        assert_eq!(CliError::Command("x".to_owned()).exit_code(), 1);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(CliError::Io(io).exit_code(), 10);
    }

    #[test]
    fn update_errors_keep_their_stage() {
        let source: WatcherError =
            UpdateError::new(UpdateStage::Create, WatcherError::DockerApi("conflict".to_owned())).into();
        let err = CliError::from(source);
        assert_eq!(err.exit_code(), 5);
        match err {
            CliError::Update { stage, message } => {
                assert_eq!(stage, Some(UpdateStage::Create));
                assert!(message.starts_with("create:"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runtime_errors_map_to_docker() {
        let err = CliError::from(WatcherError::ContainerNotFound("web".to_owned()));
        assert_eq!(err.exit_code(), 3);
    }
}
