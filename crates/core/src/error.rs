//! Error types shared by every dockwatch crate.

/// Top-level dockwatch error.
#[derive(Debug, thiserror::Error)]
pub enum DockwatchError {
    /// Configuration problem
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds a value outside its allowed range
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
