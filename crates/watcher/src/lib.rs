#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: `WatcherError`, `RegistryError`, stage-tagged `UpdateError`
//! - [`policy`]: skip/force evaluation (`evaluate`, `Decision`, `SkipReason`)
//! - [`registry`]: remote digest resolution (`RegistryResolver`, `DigestResolver`)
//! - [`docker`]: container runtime traits and `BollardDockerClient`
//! - [`pool`]: ordered bounded-parallel map
//! - [`keyed`]: per-key async locks (update per container, fetch per reference)
//! - [`scanner`]: one-shot scan (`Scanner`, `ScanOptions`)
//! - [`updater`]: container recreation with rollback (`Updater`)
//! - [`scheduler`]: scheduled scan-and-update (`Scheduler`)
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──tick──▶ Scanner.scan_once()
//!                        │  list ─▶ policy ─▶ RegistryResolver.resolve()
//!                        ▼
//!                  Vec<ContainerStatus>
//!                        │  needs_update()
//!                        ▼
//!                  Updater.update_container()   (serial)
//! ```

pub mod docker;
pub mod error;
pub mod keyed;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod updater;

// --- Public API Re-exports ---

// Errors
pub use error::{RegistryError, UpdateError, UpdateStage, WatcherError};

// Policy
pub use policy::{Decision, PolicyInput, SkipReason, evaluate};

// Registry
pub use registry::{
    DigestResolver, DigestResult, HttpManifestFetcher, ManifestFetcher, RegistryResolver,
    RemoteDigest,
};

// Docker API
pub use docker::{
    BollardDockerClient, ContainerDetails, ContainerLister, ContainerMutator, ContainerSpec,
    ImagePuller,
};

// Pipeline
pub use scanner::{ScanOptions, Scanner};
pub use scheduler::{RunReport, ScheduleMode, Scheduler, TaskInfo, UpdateNotifier};
pub use updater::Updater;
