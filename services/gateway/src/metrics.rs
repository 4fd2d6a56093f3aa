//! Prometheus metrics exposition
//!
//! Gateway-level series recorded here:
//!
//! - `gateway_requests_total` (counter): labels `status`, `stream`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_tokens_total` (counter): label `kind`
//! - `gateway_active_streams` (gauge)
//!
//! The library crates emit `gateway_failovers_total`,
//! `gateway_token_refresh_total`, `gateway_usage_dropped_total` and
//! `cache_lookups_total` through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use usage::TokenUsage;

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// Streams can stay open for minutes, so buckets reach past the proxy timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished `/v1/messages` request. For streams the duration runs
/// until response headers are sent.
pub fn record_request(status: u16, stream: bool, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "gateway_requests_total",
        "status" => status_str.clone(),
        "stream" => if stream { "true" } else { "false" }
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record an upstream failure with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_tokens(usage: &TokenUsage) {
    for (kind, count) in [
        ("input", usage.input_tokens),
        ("output", usage.output_tokens),
        ("cache_creation", usage.cache_creation_tokens),
        ("cache_read", usage.cache_read_tokens),
    ] {
        if count > 0 {
            metrics::counter!("gateway_tokens_total", "kind" => kind).increment(count);
        }
    }
}

pub fn stream_opened() {
    metrics::gauge!("gateway_active_streams").increment(1.0);
}

pub fn stream_closed() {
    metrics::gauge!("gateway_active_streams").decrement(1.0);
}
