//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::EngineStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const USERS_ONLINE: &str = "parley_users_online";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const EVENTS_BYTES: &str = "parley_events_bytes";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const ROOMS_EXPIRED_TOTAL: &str = "parley_rooms_expired_total";
    pub const DELIVERIES_DROPPED: &str = "parley_deliveries_dropped_total";
    pub const DISPATCH_LATENCY_SECONDS: &str = "parley_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events processed, by name and direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Bytes of events processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Topic rooms in live state");
    metrics::describe_counter!(names::ROOMS_EXPIRED_TOTAL, "Topic rooms expired by the sweeper");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Events dropped because a connection queue was full or closed"
    );
    metrics::describe_histogram!(
        names::DISPATCH_LATENCY_SECONDS,
        "Inbound intent handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Rejected intents and transport errors, by code");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event crossing the socket.
pub fn record_event(event: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record intent handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::DISPATCH_LATENCY_SECONDS).record(seconds);
}

/// Record an error by code.
pub fn record_error(code: &'static str) {
    counter!(names::ERRORS_TOTAL, "code" => code).increment(1);
}

/// Record rooms expired by a sweep.
pub fn record_expired_rooms(count: usize) {
    counter!(names::ROOMS_EXPIRED_TOTAL).increment(count as u64);
}

/// Publish engine gauges.
pub fn record_engine_stats(stats: &EngineStats) {
    gauge!(names::USERS_ONLINE).set(stats.online_users as f64);
    gauge!(names::ROOMS_ACTIVE).set(stats.live_rooms as f64);
    counter!(names::DELIVERIES_DROPPED).absolute(stats.dropped);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event("dm:send", 42, "inbound");
        record_error("ROOM_FULL");
        record_engine_stats(&EngineStats::default());
    }
}
