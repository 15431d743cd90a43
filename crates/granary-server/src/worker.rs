//! The load worker pool.
//!
//! N workers share the dispenser's ready stream; each leased manifest gets
//! one COPY attempt. Retryable failures re-queue the manifest through
//! `load_error`; permanent failures are logged and counted but leave the
//! manifest in `Loading` for operator triage. Workers exit when the stream
//! closes.

use std::sync::Arc;

use tokio::task::JoinHandle;

use granary_metadata::{LoadReady, Manifest, MetadataBackend};
use granary_warehouse::Warehouse;

use crate::metrics;

/// Spawns `count` load workers draining `ready`.
pub fn spawn_workers(
    count: usize,
    ready: LoadReady,
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn MetadataBackend>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let ready = ready.clone();
            let warehouse = Arc::clone(&warehouse);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tracing::info!(worker = index, "load worker started");
                while let Some(manifest) = ready.recv().await {
                    process_manifest(&*warehouse, &*store, manifest).await;
                }
                tracing::info!(worker = index, "load worker stopped");
            })
        })
        .collect()
}

/// Runs one manifest through COPY and settles its state.
pub async fn process_manifest(
    warehouse: &dyn Warehouse,
    store: &dyn MetadataBackend,
    manifest: Manifest,
) {
    tracing::info!(
        manifest_uuid = %manifest.uuid,
        table = %manifest.table_name,
        num_files = manifest.urls.len(),
        attempts = manifest.attempts,
        "loading manifest into table"
    );

    match warehouse
        .manifest_copy(&manifest.table_name, &manifest.manifest_url)
        .await
    {
        Ok(()) => {
            if let Err(error) = store.load_done(manifest.uuid).await {
                // The COPY committed; the queue cleanup will be redone by
                // crash recovery if this keeps failing.
                tracing::error!(
                    %error,
                    manifest_uuid = %manifest.uuid,
                    "load committed but load_done failed"
                );
                return;
            }
            metrics::record_manifest_loaded(&manifest.table_name, manifest.urls.len());
            tracing::info!(
                manifest_uuid = %manifest.uuid,
                table = %manifest.table_name,
                "loaded manifest into table"
            );
        }
        Err(error) => {
            let retryable = error.is_retryable();
            metrics::record_manifest_failure(retryable);
            tracing::error!(
                %error,
                retryable,
                manifest_uuid = %manifest.uuid,
                table = %manifest.table_name,
                "error loading manifest into table"
            );
            if retryable {
                if let Err(error) = store
                    .load_error(manifest.uuid, &error.to_string())
                    .await
                {
                    tracing::error!(
                        %error,
                        manifest_uuid = %manifest.uuid,
                        "recording load error failed"
                    );
                }
            }
            // Permanent failures leave the manifest in Loading for triage.
        }
    }
}
