//! Prometheus exporter.
//!
//! Uses the HTTP listener built into `metrics-exporter-prometheus`; every
//! `metrics::counter!` / `gauge!` / `histogram!` call in the workspace lands
//! on `http://{listen_addr}:{port}/metrics` once installed.

use std::net::SocketAddr;

use anyhow::Result;
use dockwatch_core::config::MetricsConfig;
use dockwatch_core::metrics as m;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Parses `listen_addr:port`.
pub fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    let host = if config.listen_addr.contains(':') && !config.listen_addr.starts_with('[') {
        format!("[{}]", config.listen_addr)
    } else {
        config.listen_addr.clone()
    };
    format!("{host}:{}", config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address: {e}"))
}

/// Installs the global recorder and starts the listener. Once per process.
///
/// # Errors
///
/// Bad address, bind failure, or a recorder already installed.
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;

    m::describe_all();
    metrics::gauge!(m::BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}
