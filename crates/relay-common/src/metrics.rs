//! Prometheus metrics export.
//!
//! Installs the global `metrics` crate recorder and hands back a handle whose
//! `render()` produces Prometheus text exposition format. Call [`install`]
//! once per process, before any `metrics::counter!`/`gauge!`/`histogram!`
//! call sites run (e.g. `relay_router::router_metrics`), then mount the
//! handle behind a `/metrics` route.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder and return a handle for
/// rendering scrape output.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
