#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Errors
pub use error::{ConfigError, DockwatchError};

// Configuration
pub use config::{ConfigProvider, DockwatchConfig, RegistryAuth, SharedConfig};

// Domain types
pub use types::{ContainerSnapshot, ContainerStatus, PortMapping, ScanStatus};
