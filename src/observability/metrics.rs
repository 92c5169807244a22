//! Metrics collection and exposition.
//!
//! # Metrics
//! - `upstream_selections_total` (counter): selections by group, method, peer
//! - `upstream_fallbacks_total` (counter): hand-offs from ip_hash to round robin
//! - `upstream_rejections_total` (counter): skipped candidates by reason
//! - `upstream_peer_failures_total` (counter): reported connection failures
//! - `upstream_peer_active_connections` (gauge): connections per peer
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exposition is opt-in

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus recorder with an HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_selection(group: &str, method: &'static str, peer: &str) {
    counter!(
        "upstream_selections_total",
        "group" => group.to_string(),
        "method" => method,
        "peer" => peer.to_string()
    )
    .increment(1);
}

pub fn record_fallback(group: &str) {
    counter!("upstream_fallbacks_total", "group" => group.to_string()).increment(1);
}

pub fn record_rejection(group: &str, reason: &'static str) {
    counter!(
        "upstream_rejections_total",
        "group" => group.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_peer_failure(group: &str, peer: &str) {
    counter!(
        "upstream_peer_failures_total",
        "group" => group.to_string(),
        "peer" => peer.to_string()
    )
    .increment(1);
}

pub fn record_active_connections(group: &str, peer: &str, conns: usize) {
    gauge!(
        "upstream_peer_active_connections",
        "group" => group.to_string(),
        "peer" => peer.to_string()
    )
    .set(conns as f64);
}
