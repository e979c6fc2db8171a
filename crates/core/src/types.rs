//! Domain types shared by the watcher, daemon and CLI.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published port of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Host IP the port is bound to (empty when unbound)
    pub ip: String,
    pub private_port: u16,
    pub public_port: Option<u16>,
    /// tcp, udp, sctp
    pub protocol: String,
}

/// Point-in-time view of one container, taken once per scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    /// Image reference the container was created from (`nginx:latest`)
    pub image: String,
    /// Local repo digests, `repository@sha256:HASH`
    pub repo_digests: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Runtime state string (`running`, `exited`, ...)
    pub state: String,
    pub started_at: String,
    pub ports: Vec<PortMapping>,
}

impl ContainerSnapshot {
    /// State comparison is case-insensitive.
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

impl fmt::Display for ContainerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) image={}", self.name, self.id, self.image)
    }
}

/// Outcome of checking one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    UpToDate,
    UpdateAvailable,
    Skipped,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "UpToDate",
            Self::UpdateAvailable => "UpdateAvailable",
            Self::Skipped => "Skipped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-container scan result. Built once per scan and handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub current_digest: Vec<String>,
    pub remote_digest: String,
    pub status: ScanStatus,
    pub skipped: bool,
    /// Skip reason, or `registry: ...` for resolver failures
    pub skip_reason: String,
    pub labels: HashMap<String, String>,
    pub last_checked_at: DateTime<Utc>,
    pub started_at: String,
    pub ports: Vec<PortMapping>,
}

impl ContainerStatus {
    /// Starts a status from a snapshot. `status` is filled in by the scanner.
    pub fn from_snapshot(snapshot: &ContainerSnapshot, checked_at: DateTime<Utc>) -> Self {
        Self {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            image: snapshot.image.clone(),
            running: snapshot.is_running(),
            current_digest: snapshot.repo_digests.clone(),
            remote_digest: String::new(),
            status: ScanStatus::UpToDate,
            skipped: false,
            skip_reason: String::new(),
            labels: snapshot.labels.clone(),
            last_checked_at: checked_at,
            started_at: snapshot.started_at.clone(),
            ports: snapshot.ports.clone(),
        }
    }

    /// True when the scheduler should act on this container.
    pub fn needs_update(&self) -> bool {
        self.status == ScanStatus::UpdateAvailable && !self.skipped
    }
}
