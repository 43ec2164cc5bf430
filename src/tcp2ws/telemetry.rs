use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::tcp2ws::tunnel::{protocol::Framing, session::SessionState};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub framing: Framing,
    pub pending_chunks: usize,
    pub idle_secs: u64,
    pub age_secs: u64,
}

pub fn session_opened() {
    metrics::counter!("tcp2ws_sessions_total").increment(1);
    metrics::gauge!("tcp2ws_active_sessions").increment(1.0);
}

pub fn session_closed() {
    metrics::gauge!("tcp2ws_active_sessions").decrement(1.0);
}

pub fn session_resumed() {
    metrics::counter!("tcp2ws_resumes_total").increment(1);
}

pub fn session_redialed() {
    metrics::counter!("tcp2ws_redials_total").increment(1);
}

pub fn session_reaped() {
    metrics::counter!("tcp2ws_reaped_total").increment(1);
}

pub fn pump_restarted(pump: &'static str) {
    metrics::counter!("tcp2ws_pump_restarts_total", "pump" => pump).increment(1);
}

pub fn record_bytes_to_tunnel(n: usize) {
    metrics::counter!("tcp2ws_bytes_to_tunnel_total").increment(n as u64);
}

pub fn record_bytes_to_backend(n: usize) {
    metrics::counter!("tcp2ws_bytes_to_backend_total").increment(n as u64);
}
