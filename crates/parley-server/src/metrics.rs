//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "parley_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const EVENTS_BYTES: &str = "parley_events_bytes";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const USERS_ONLINE: &str = "parley_users_online";
    pub const LATENCY_SECONDS: &str = "parley_event_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const STORE_FAILURES_TOTAL: &str = "parley_store_failures_total";
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
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events processed, by direction and kind");
    metrics::describe_counter!(names::EVENTS_BYTES, "Encoded bytes of events processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_gauge!(names::USERS_ONLINE, "Connections that have joined");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors, by code or kind");
    metrics::describe_counter!(
        names::STORE_FAILURES_TOTAL,
        "Persistence calls that failed or timed out"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

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

/// Record a connection refused at capacity.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record an event.
pub fn record_event(kind: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction, "kind" => kind).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update room and user gauges.
pub fn set_router_gauges(rooms: usize, users: usize) {
    gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
    gauge!(names::USERS_ONLINE).set(users as f64);
}

/// Publish the running count of failed store calls.
pub fn set_store_failures(total: u64) {
    counter!(names::STORE_FAILURES_TOTAL).absolute(total);
}

/// Record an error.
pub fn record_error(kind: &str) {
    counter!(names::ERRORS_TOTAL, "type" => kind.to_string()).increment(1);
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
    fn test_recording_without_recorder() {
        // Without an installed recorder every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event("join", 42, "inbound");
        record_error("1001");
        set_store_failures(3);
    }
}
