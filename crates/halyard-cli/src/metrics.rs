//! Prometheus recorder for commands that report metrics.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and registers every Halyard
/// metric description.
///
/// Safe to call multiple times; later calls return the first handle.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    halyard_core::metrics::register_metrics();
    halyard_auth::metrics::register_metrics();
    halyard_notify::metrics::register_metrics();
    tracing::debug!("prometheus metrics recorder initialized");

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}
