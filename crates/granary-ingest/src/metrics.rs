//! Ingress metrics.
//!
//! Prometheus-exported counters; per-table outcomes carry labels instead of
//! dotted statsd names.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Fragment announcements by table and outcome
/// (`received`, `queued`, `loaded`, `skipped_unroutable`).
pub const FRAGMENTS_TOTAL: &str = "granary_fragments_total";

/// Queue deliveries dropped by the dedup filter.
pub const INGEST_DUPLICATES_TOTAL: &str = "granary_ingest_duplicates_total";

/// Deliveries that failed verification, admission, or persistence.
pub const INGEST_ERRORS_TOTAL: &str = "granary_ingest_errors_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder. Safe to call multiple times.
///
/// # Panics
///
/// Panics if the recorder cannot be installed; the service must not start
/// without its primary operational signal.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));
            describe_counter!(FRAGMENTS_TOTAL, "Fragment announcements by table and outcome");
            describe_counter!(
                INGEST_DUPLICATES_TOTAL,
                "Queue deliveries dropped by the dedup filter"
            );
            describe_counter!(INGEST_ERRORS_TOTAL, "Deliveries that failed processing");
            handle
        })
        .clone()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records a per-table fragment outcome, plus the `total` rollup.
pub fn record_fragment(table: &str, outcome: &'static str) {
    counter!(FRAGMENTS_TOTAL, "table" => table.to_string(), "outcome" => outcome).increment(1);
    counter!(FRAGMENTS_TOTAL, "table" => "total".to_string(), "outcome" => outcome).increment(1);
}

/// Records a dedup drop.
pub fn record_duplicate() {
    counter!(INGEST_DUPLICATES_TOTAL).increment(1);
}

/// Records a failed delivery.
pub fn record_error(stage: &'static str) {
    counter!(INGEST_ERRORS_TOTAL, "stage" => stage).increment(1);
}
