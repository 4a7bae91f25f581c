//! Prometheus Metrics Definitions
//!
//! Defines all COMMANDER metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use commander_storage::{OutboxStats, SyncMetricsSnapshot};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<CommanderMetrics>> = Lazy::new(CommanderMetrics::new);

/// The global metrics, if registration succeeded.
pub fn metrics() -> Option<&'static CommanderMetrics> {
    METRICS.as_ref().ok()
}

fn register_err(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {name}: {e}"))
}

/// Container for all COMMANDER metrics.
#[derive(Clone)]
pub struct CommanderMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Envelope writes - labels: outcome (stored/duplicate/rejected)
    pub envelopes_written_total: CounterVec,

    pub outbox_pending: IntGauge,
    pub outbox_failed: IntGauge,

    /// Fire-and-forget pushes that failed since startup.
    pub relay_push_failures: IntGauge,

    /// Observed node transitions - labels: status
    pub node_transitions_total: CounterVec,

    /// Frames emitted by the broadcaster - labels: type
    pub stream_frames_total: CounterVec,

    /// Current stream subscribers
    pub stream_subscribers: IntGauge,

    /// Subscribers disconnected for lagging
    pub stream_subscribers_dropped_total: IntCounter,
}

impl CommanderMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "commander_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| register_err("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "commander_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| register_err("http_request_duration_seconds", e))?,

            envelopes_written_total: register_counter_vec!(
                "commander_envelopes_written_total",
                "Envelope writes by outcome",
                &["outcome"]
            )
            .map_err(|e| register_err("envelopes_written_total", e))?,

            outbox_pending: register_int_gauge!(
                "commander_outbox_pending",
                "Outbox records awaiting relay delivery"
            )
            .map_err(|e| register_err("outbox_pending", e))?,

            outbox_failed: register_int_gauge!(
                "commander_outbox_failed",
                "Outbox records that exhausted their retry budget"
            )
            .map_err(|e| register_err("outbox_failed", e))?,

            relay_push_failures: register_int_gauge!(
                "commander_relay_push_failures",
                "Immediate relay pushes that failed since startup"
            )
            .map_err(|e| register_err("relay_push_failures", e))?,

            node_transitions_total: register_counter_vec!(
                "commander_node_transitions_total",
                "Node status transitions observed, by new status",
                &["status"]
            )
            .map_err(|e| register_err("node_transitions_total", e))?,

            stream_frames_total: register_counter_vec!(
                "commander_stream_frames_total",
                "Frames emitted on the state stream",
                &["type"]
            )
            .map_err(|e| register_err("stream_frames_total", e))?,

            stream_subscribers: register_int_gauge!(
                "commander_stream_subscribers",
                "Current number of state stream subscribers"
            )
            .map_err(|e| register_err("stream_subscribers", e))?,

            stream_subscribers_dropped_total: register_int_counter!(
                "commander_stream_subscribers_dropped_total",
                "Subscribers disconnected for falling behind"
            )
            .map_err(|e| register_err("stream_subscribers_dropped_total", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_envelope_write(&self, outcome: &str) {
        self.envelopes_written_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Mirror sync engine state into the gauges.
    pub fn record_sync(&self, outbox: &OutboxStats, sync: &SyncMetricsSnapshot) {
        self.outbox_pending
            .set((outbox.pending + outbox.sending) as i64);
        self.outbox_failed.set(outbox.failed as i64);
        self.relay_push_failures.set(sync.push_failures as i64);
    }

    pub fn record_node_transition(&self, status: &str) {
        self.node_transitions_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_frame(&self, frame_type: &str) {
        self.stream_frames_total
            .with_label_values(&[frame_type])
            .inc();
    }

    pub fn subscriber_connected(&self) {
        self.stream_subscribers.inc();
    }

    pub fn subscriber_disconnected(&self) {
        self.stream_subscribers.dec();
    }

    pub fn subscriber_dropped(&self) {
        self.stream_subscribers_dropped_total.inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    // Touch the registry so the first scrape lists every family.
    let _ = metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
