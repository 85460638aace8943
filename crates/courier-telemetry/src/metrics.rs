//! Prometheus metrics recorder and metric names.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Buckets for connection lifetimes, from a second to about an hour.
const CONNECTION_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

fn builder() -> Result<PrometheusBuilder, TelemetryError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(WS_CONNECTION_DURATION_SECONDS.to_string()),
            CONNECTION_DURATION_BUCKETS,
        )
        .map_err(|e| TelemetryError::Recorder(e.to_string()))
}

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = builder()?
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
///
/// Servers built in tests render from this so they never race over the
/// global recorder.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe_metrics() {
    describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_counter!(WS_DISCONNECTIONS_TOTAL, "WebSocket sessions ended");
    describe_counter!(
        WS_CONNECTIONS_REJECTED_TOTAL,
        "Connections refused at capacity or on invalid setup"
    );
    describe_gauge!(WS_CONNECTIONS_ACTIVE, "Currently open WebSocket sessions");
    describe_histogram!(
        WS_CONNECTION_DURATION_SECONDS,
        Unit::Seconds,
        "Lifetime of a WebSocket session"
    );
    describe_counter!(WORKERS_STARTED_TOTAL, "Mailbox workers started");
    describe_counter!(WORKERS_STOPPED_TOTAL, "Mailbox workers stopped");
    describe_counter!(WORKER_STOP_TIMEOUTS_TOTAL, "Delivery tasks aborted after the stop timeout");
    describe_counter!(MESSAGES_DELIVERED_TOTAL, "Messages sent to a peer");
    describe_counter!(MESSAGES_DROPPED_TOTAL, "Messages discarded by a stopped worker");
    describe_counter!(SEND_FAILURES_TOTAL, "Transport send or ping failures");
    describe_counter!(BROADCASTS_TOTAL, "Broadcast calls");
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connections refused (counter, labels: reason).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Workers started total (counter).
pub const WORKERS_STARTED_TOTAL: &str = "workers_started_total";
/// Workers stopped total (counter, labels: reason).
pub const WORKERS_STOPPED_TOTAL: &str = "workers_stopped_total";
/// Delivery tasks aborted on stop (counter).
pub const WORKER_STOP_TIMEOUTS_TOTAL: &str = "worker_stop_timeouts_total";
/// Messages delivered total (counter).
pub const MESSAGES_DELIVERED_TOTAL: &str = "messages_delivered_total";
/// Messages dropped total (counter).
pub const MESSAGES_DROPPED_TOTAL: &str = "messages_dropped_total";
/// Send failures total (counter, labels: `error_kind`).
pub const SEND_FAILURES_TOTAL: &str = "send_failures_total";
/// Broadcast calls total (counter).
pub const BROADCASTS_TOTAL: &str = "broadcasts_total";
