//! Localhost control surface and health endpoints.
//!
//! Operators force loads, probe table existence, and bump versions for
//! drop/rename reconciliation here. Version increments travel over the
//! migrator's channel so they serialize with migrations.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use granary_core::VersionCache;
use granary_metadata::MetadataBackend;
use granary_warehouse::Warehouse;

use crate::metrics;
use crate::migrator::{IncrementError, VersionIncrement};

/// Shared state for the control handlers.
#[derive(Clone)]
pub struct ControlState {
    /// The metadata store, for force-load requests and the health probe.
    pub store: Arc<dyn MetadataBackend>,
    /// The warehouse, for existence probes and the health ping.
    pub warehouse: Arc<dyn Warehouse>,
    /// The version cache, consulted before the warehouse catalog.
    pub versions: Arc<VersionCache>,
    /// Channel into the migrator loop.
    pub increments: mpsc::Sender<VersionIncrement>,
}

/// Builds the control router.
pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/control/ingest", post(force_ingest))
        .route("/control/table_exists/:table", get(table_exists))
        .route("/control/increment_version/:table", post(increment_version))
        .route("/health", get(health))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    table: String,
}

/// POST /control/ingest - flush a table's queue now and permit on-peak
/// migration.
async fn force_ingest(
    State(state): State<ControlState>,
    Json(request): Json<IngestRequest>,
) -> impl IntoResponse {
    match state.store.force_load(&request.table, "control-api").await {
        Ok(()) => {
            tracing::info!(table = %request.table, "force-load requested");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "ok" })),
            )
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": error.to_string() })),
        ),
    }
}

/// GET /control/table_exists/:table - the version cache answers first,
/// the warehouse catalog breaks ties.
async fn table_exists(
    State(state): State<ControlState>,
    Path(table): Path<String>,
) -> impl IntoResponse {
    if state.versions.get(&table).is_some() {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "exists": true })),
        );
    }
    match state.warehouse.table_exists(&table).await {
        Ok(exists) => (
            StatusCode::OK,
            Json(serde_json::json!({ "exists": exists })),
        ),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": error.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct IncrementRequest {
    version: i64,
}

/// POST /control/increment_version/:table - bump a never-created table's
/// version without DDL.
async fn increment_version(
    State(state): State<ControlState>,
    Path(table): Path<String>,
    Json(request): Json<IncrementRequest>,
) -> impl IntoResponse {
    let (respond, response) = oneshot::channel();
    let sent = state
        .increments
        .send(VersionIncrement {
            table: table.clone(),
            version: request.version,
            respond,
        })
        .await;
    if sent.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "migrator is not running" })),
        );
    }

    match response.await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Ok(Err(error @ IncrementError::TableExists(_))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": error.to_string() })),
        ),
        Ok(Err(error)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": error.to_string() })),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "migrator dropped the request" })),
        ),
    }
}

/// GET /health - 200 iff both the warehouse ping and a lightweight
/// metadata-store read succeed.
async fn health(State(state): State<ControlState>) -> impl IntoResponse {
    let warehouse_ok = state.warehouse.health_check().await.is_ok();
    let store_ok = state.store.health_check().await.is_ok();
    if warehouse_ok && store_ok {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "warehouse": warehouse_ok,
                "metadata": store_ok,
            })),
        )
    }
}
