//! Loader metrics.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Manifest loads that reached the warehouse.
pub const MANIFEST_LOADS_TOTAL: &str = "granary_manifest_loads_total";

/// Manifest loads that failed, by failure class.
pub const MANIFEST_LOAD_FAILURES_TOTAL: &str = "granary_manifest_load_failures_total";

/// Fragments by table and outcome; the loader records `loaded`.
pub const FRAGMENTS_TOTAL: &str = "granary_fragments_total";

/// Migration attempts by table and outcome.
pub const MIGRATIONS_TOTAL: &str = "granary_migrations_total";

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
            describe_counter!(MANIFEST_LOADS_TOTAL, "Manifest loads committed to the warehouse");
            describe_counter!(
                MANIFEST_LOAD_FAILURES_TOTAL,
                "Manifest loads that failed, by failure class"
            );
            describe_counter!(FRAGMENTS_TOTAL, "Fragments by table and outcome");
            describe_counter!(MIGRATIONS_TOTAL, "Migration attempts by table and outcome");
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

/// Records a committed manifest load of `fragments` files into `table`.
pub fn record_manifest_loaded(table: &str, fragments: usize) {
    counter!(MANIFEST_LOADS_TOTAL).increment(1);
    counter!(FRAGMENTS_TOTAL, "table" => table.to_string(), "outcome" => "loaded")
        .increment(fragments as u64);
}

/// Records a failed manifest load.
pub fn record_manifest_failure(retryable: bool) {
    let class = if retryable { "retryable" } else { "permanent" };
    counter!(MANIFEST_LOAD_FAILURES_TOTAL, "class" => class).increment(1);
}

/// Records a migration outcome for `table`.
pub fn record_migration(table: &str, outcome: &'static str) {
    counter!(MIGRATIONS_TOTAL, "table" => table.to_string(), "outcome" => outcome).increment(1);
}
