//! Configuration management: `dockwatch.toml` parsing, env overrides and the
//! snapshot provider handed to every component.
//!
//! # Loading priority
//! 1. CLI flags (highest)
//! 2. Environment variables (`DOCKWATCH_SCAN_CONCURRENCY=8`)
//! 3. Config file (`dockwatch.toml`)
//! 4. Defaults (`Default` impls)
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), dockwatch_core::error::DockwatchError> {
//! use dockwatch_core::config::DockwatchConfig;
//!
//! let config = DockwatchConfig::load("dockwatch.toml").await?;
//! let config = DockwatchConfig::parse("[scan]\nconcurrency = 8")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, DockwatchError};

/// Upper bound for any worker pool or registry fan-out.
pub const MAX_CONCURRENCY: usize = 64;

/// Top-level `dockwatch.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockwatchConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl DockwatchConfig {
    /// Loads a TOML file, applies environment overrides, then validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DockwatchError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, DockwatchError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DockwatchError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                DockwatchError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses a TOML string. Missing sections fall back to defaults.
    pub fn parse(toml_str: &str) -> Result<Self, DockwatchError> {
        toml::from_str(toml_str).map_err(|e| {
            DockwatchError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `DOCKWATCH_{SECTION}_{FIELD}` environment variables.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "DOCKWATCH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "DOCKWATCH_GENERAL_LOG_FORMAT");

        override_string(&mut self.docker.socket, "DOCKWATCH_DOCKER_SOCKET");
        override_bool(
            &mut self.docker.include_stopped,
            "DOCKWATCH_DOCKER_INCLUDE_STOPPED",
        );

        override_string(&mut self.scan.cron, "DOCKWATCH_SCAN_CRON");
        override_u64(&mut self.scan.interval_secs, "DOCKWATCH_SCAN_INTERVAL_SECS");
        override_usize(&mut self.scan.concurrency, "DOCKWATCH_SCAN_CONCURRENCY");
        override_u64(&mut self.scan.cache_ttl_secs, "DOCKWATCH_SCAN_CACHE_TTL_SECS");
        override_bool(&mut self.scan.update_enabled, "DOCKWATCH_SCAN_UPDATE_ENABLED");
        override_bool(
            &mut self.scan.allow_compose_update,
            "DOCKWATCH_SCAN_ALLOW_COMPOSE_UPDATE",
        );
        override_u64(
            &mut self.scan.update_timeout_secs,
            "DOCKWATCH_SCAN_UPDATE_TIMEOUT_SECS",
        );
        override_bool(
            &mut self.scan.initial_scan_on_start,
            "DOCKWATCH_SCAN_INITIAL_SCAN_ON_START",
        );

        override_csv(&mut self.policy.skip_labels, "DOCKWATCH_POLICY_SKIP_LABELS");
        override_csv(&mut self.policy.only_labels, "DOCKWATCH_POLICY_ONLY_LABELS");
        override_bool(
            &mut self.policy.skip_local_build,
            "DOCKWATCH_POLICY_SKIP_LOCAL_BUILD",
        );
        override_bool(
            &mut self.policy.skip_pinned_digest,
            "DOCKWATCH_POLICY_SKIP_PINNED_DIGEST",
        );
        override_bool(
            &mut self.policy.skip_semver_pinned,
            "DOCKWATCH_POLICY_SKIP_SEMVER_PINNED",
        );
        override_csv(
            &mut self.policy.floating_tags,
            "DOCKWATCH_POLICY_FLOATING_TAGS",
        );

        override_string(&mut self.registry.proxy_url, "DOCKWATCH_REGISTRY_PROXY_URL");
        override_u64(
            &mut self.registry.request_timeout_secs,
            "DOCKWATCH_REGISTRY_REQUEST_TIMEOUT_SECS",
        );

        override_bool(&mut self.metrics.enabled, "DOCKWATCH_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "DOCKWATCH_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "DOCKWATCH_METRICS_PORT");
    }

    /// Validates value ranges and formats.
    pub fn validate(&self) -> Result<(), DockwatchError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.scan.concurrency == 0 || self.scan.concurrency > MAX_CONCURRENCY {
            return Err(invalid(
                "scan.concurrency",
                format!("must be between 1 and {MAX_CONCURRENCY}"),
            ));
        }

        if self.scan.cron.trim().is_empty() {
            if self.scan.interval_secs == 0 {
                return Err(invalid(
                    "scan.interval_secs",
                    "must be greater than 0 when no cron expression is set".to_owned(),
                ));
            }
        } else if let Err(e) = cron::Schedule::from_str(self.scan.cron.trim()) {
            return Err(invalid("scan.cron", format!("invalid cron expression: {e}")));
        }

        if self.scan.cache_ttl_secs == 0 {
            return Err(invalid(
                "scan.cache_ttl_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.scan.update_timeout_secs == 0 {
            return Err(invalid(
                "scan.update_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        for (i, auth) in self.registry.auth.iter().enumerate() {
            if auth.host.trim().is_empty() {
                return Err(invalid(
                    &format!("registry.auth[{i}].host"),
                    "must not be empty".to_owned(),
                ));
            }
        }

        if self.registry.request_timeout_secs == 0 {
            return Err(invalid(
                "registry.request_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> DockwatchError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// Docker connection and container discovery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Socket path; empty means bollard's local defaults (`DOCKER_HOST` aware)
    pub socket: String,
    /// Include stopped containers in scans
    pub include_stopped: bool,
}

/// Scan and scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Six-field cron expression (seconds first). Empty selects interval mode.
    pub cron: String,
    /// Interval between scan-only passes when `cron` is empty
    pub interval_secs: u64,
    /// Worker count for scans and registry fan-out
    pub concurrency: usize,
    /// Remote digest cache TTL
    pub cache_ttl_secs: u64,
    /// Apply updates after a scheduled scan
    pub update_enabled: bool,
    /// Allow updating compose-managed containers
    pub allow_compose_update: bool,
    /// Upper bound for one container update inside a scheduled run
    pub update_timeout_secs: u64,
    /// Run the scheduled job once as soon as the scheduler starts
    pub initial_scan_on_start: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 */2 * * *".to_owned(),
            interval_secs: 600,
            concurrency: 3,
            cache_ttl_secs: 600,
            update_enabled: true,
            allow_compose_update: false,
            update_timeout_secs: 300,
            initial_scan_on_start: false,
        }
    }
}

/// Update policy switches and label filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub skip_labels: Vec<String>,
    pub only_labels: Vec<String>,
    pub skip_local_build: bool,
    pub skip_pinned_digest: bool,
    pub skip_semver_pinned: bool,
    pub floating_tags: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            skip_labels: vec!["watchdocker.skip=true".to_owned()],
            only_labels: Vec::new(),
            skip_local_build: true,
            skip_pinned_digest: true,
            skip_semver_pinned: true,
            floating_tags: vec!["latest".to_owned(), "main".to_owned(), "stable".to_owned()],
        }
    }
}

/// Per-registry credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// `docker.io`, `ghcr.io` or a private registry host
    pub host: String,
    pub username: String,
    /// Access token or password
    pub token: String,
}

/// Registry access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub auth: Vec<RegistryAuth>,
    /// HTTP(S)/SOCKS proxy URL, empty for none
    pub proxy_url: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth: Vec::new(),
            proxy_url: String::new(),
            request_timeout_secs: 60,
            user_agent: format!("dockwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9187,
        }
    }
}

// --- snapshot provider ---

/// Source of the current configuration snapshot.
///
/// Components call [`snapshot`](Self::snapshot) at the start of every scan,
/// update or scheduler start instead of caching configuration themselves.
pub trait ConfigProvider: Send + Sync + 'static {
    fn snapshot(&self) -> Arc<DockwatchConfig>;
}

impl ConfigProvider for Arc<DockwatchConfig> {
    fn snapshot(&self) -> Arc<DockwatchConfig> {
        Arc::clone(self)
    }
}

/// Replaceable configuration shared between the daemon and its components.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<DockwatchConfig>>>,
}

impl SharedConfig {
    pub fn new(config: DockwatchConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Publishes a new snapshot. Operations already in flight keep the old one.
    pub fn replace(&self, config: DockwatchConfig) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }
}

impl ConfigProvider for SharedConfig {
    fn snapshot(&self) -> Arc<DockwatchConfig> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
