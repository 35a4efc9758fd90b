//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Lines**: Counts of lines read from sources, sent to and dropped for clients
//! - **Clients**: Connected clients by transport
//! - **Tailers**: Running tailers, starts by strategy, permission fallbacks
//! - **Errors**: Stream errors by kind
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Line counters
    describe_counter!(
        "log_relay_lines_received_total",
        "Total lines read from log sources"
    );
    describe_counter!(
        "log_relay_lines_sent_total",
        "Total line deliveries queued for clients"
    );
    describe_counter!(
        "log_relay_lines_dropped_total",
        "Total messages dropped because a client queue was full"
    );

    // Client and tailer gauges
    describe_gauge!("log_relay_clients", "Number of connected clients");
    describe_gauge!("log_relay_active_tailers", "Number of running tailers");

    // Tailer lifecycle
    describe_counter!(
        "log_relay_tailer_starts_total",
        "Total tailers started by follow strategy"
    );
    describe_counter!(
        "log_relay_fallbacks_total",
        "Total permission fallbacks by abandoned strategy"
    );

    // Errors
    describe_counter!(
        "log_relay_stream_errors_total",
        "Total stream errors by kind"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Client transport label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Bidirectional WebSocket client.
    WebSocket,
    /// One-way Server-Sent Events client.
    Sse,
}

impl Transport {
    /// Label value for this transport.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        }
    }
}

/// Record a line read from a source.
pub fn record_line_received(source: &str) {
    counter!(
        "log_relay_lines_received_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record line deliveries queued for clients.
pub fn record_lines_sent(count: usize) {
    counter!("log_relay_lines_sent_total").increment(count as u64);
}

/// Record messages dropped for a slow client.
pub fn record_lines_dropped(transport: Transport, count: u64) {
    counter!(
        "log_relay_lines_dropped_total",
        "transport" => transport.as_str()
    )
    .increment(count);
}

/// Update the connected client count for a transport.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(transport: Transport, count: usize) {
    gauge!(
        "log_relay_clients",
        "transport" => transport.as_str()
    )
    .set(count as f64);
}

/// Update the running tailer count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_tailers(count: usize) {
    gauge!("log_relay_active_tailers").set(count as f64);
}

/// Record a tailer start.
pub fn record_tailer_start(strategy: &str) {
    counter!(
        "log_relay_tailer_starts_total",
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

/// Record a permission fallback away from `from`.
pub fn record_fallback(from: &str) {
    counter!(
        "log_relay_fallbacks_total",
        "from" => from.to_string()
    )
    .increment(1);
}

/// Record a stream error.
pub fn record_stream_error(kind: &'static str) {
    counter!(
        "log_relay_stream_errors_total",
        "kind" => kind
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
