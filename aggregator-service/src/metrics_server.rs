use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the global Prometheus recorder. Later calls are no-ops.
pub fn init() -> anyhow::Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))?;

    // Ignore error if the handle was already set by a racing caller.
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

/// Prometheus text exposition, or `None` when no recorder is installed.
pub fn render() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}
