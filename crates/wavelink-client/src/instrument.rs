//! Metrics instrumentation.
//!
//! Counters and gauges are emitted through the `metrics` facade; the
//! embedding application decides whether and where to export them.

use metrics::{counter, gauge, histogram};
use tracing::info;

use crate::connection::ConnectionState;

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "wavelink_messages_total";
    pub const CONNECT_ATTEMPTS_TOTAL: &str = "wavelink_connect_attempts_total";
    pub const RECONNECTS_SCHEDULED_TOTAL: &str = "wavelink_reconnects_scheduled_total";
    pub const PUBLISHES_TOTAL: &str = "wavelink_publishes_total";
    pub const QUEUE_DEPTH: &str = "wavelink_queue_depth";
    pub const CONNECTION_STATE: &str = "wavelink_connection_state";
    pub const HEARTBEAT_RTT_SECONDS: &str = "wavelink_heartbeat_rtt_seconds";
}

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages received over the stream, by type"
    );
    metrics::describe_counter!(
        names::CONNECT_ATTEMPTS_TOTAL,
        "Stream connection attempts since construction"
    );
    metrics::describe_counter!(
        names::RECONNECTS_SCHEDULED_TOTAL,
        "Reconnect attempts scheduled after unexpected stream loss"
    );
    metrics::describe_counter!(
        names::PUBLISHES_TOTAL,
        "Outbound publishes, by outcome (sent/queued/rejected)"
    );
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Publishes waiting for connectivity");
    metrics::describe_gauge!(
        names::CONNECTION_STATE,
        "Connection state (0=disconnected 1=connecting 2=connected 3=error)"
    );
    metrics::describe_histogram!(
        names::HEARTBEAT_RTT_SECONDS,
        "Heartbeat round-trip time in seconds"
    );

    info!("Metrics initialized");
}

/// Record a received message.
pub fn record_message(kind: &str) {
    counter!(names::MESSAGES_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record a connection attempt.
pub fn record_connect_attempt() {
    counter!(names::CONNECT_ATTEMPTS_TOTAL).increment(1);
}

/// Record a scheduled reconnect.
pub fn record_reconnect_scheduled() {
    counter!(names::RECONNECTS_SCHEDULED_TOTAL).increment(1);
}

/// Record an outbound publish outcome.
pub fn record_publish(outcome: &str) {
    counter!(names::PUBLISHES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Update the offline queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

/// Update the connection-state gauge.
pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Error => 3.0,
    };
    gauge!(names::CONNECTION_STATE).set(value);
}

/// Record a heartbeat round trip.
pub fn record_heartbeat_rtt(seconds: f64) {
    histogram!(names::HEARTBEAT_RTT_SECONDS).record(seconds);
}
