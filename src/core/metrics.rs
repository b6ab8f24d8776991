// src/core/metrics.rs

//! Defines and registers Prometheus metrics for session monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Server-wide Gauges ---
    /// The number of sessions currently in the connected state.
    pub static ref CONNECTED_SESSIONS: Gauge =
        register_gauge!("questlink_connected_sessions", "Number of currently connected sessions.").unwrap();


    // --- Counters ---
    /// The total number of sockets accepted by the server since startup.
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: Counter =
        register_counter!("questlink_connections_accepted_total", "Total number of sockets accepted.").unwrap();
    /// Handshakes that ended in a rejection, labeled by reason.
    pub static ref HANDSHAKE_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("questlink_handshake_failures_total", "Total number of rejected handshakes, labeled by reason.", &["reason"]).unwrap();
    /// The total number of commands written to a socket.
    pub static ref COMMANDS_SENT_TOTAL: Counter =
        register_counter!("questlink_commands_sent_total", "Total number of commands written.").unwrap();
    /// The total number of commands parsed from a socket.
    pub static ref COMMANDS_RECEIVED_TOTAL: Counter =
        register_counter!("questlink_commands_received_total", "Total number of commands read.").unwrap();
    pub static ref RPC_CALLS_TOTAL: Counter =
        register_counter!("questlink_rpc_calls_total", "Total number of remote calls issued.").unwrap();


    // --- Histograms ---
    /// Time from issuing a remote call to receiving its response.
    pub static ref RPC_LATENCY_SECONDS: Histogram =
        register_histogram!("questlink_rpc_latency_seconds", "Latency of remote calls in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
