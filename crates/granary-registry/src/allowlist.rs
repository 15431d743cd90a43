//! The ingest allow-list: which tables may be loaded into the warehouse.
//!
//! The list is a JSON document in object storage, refreshed on a timer by
//! a background task. Readers see a process-wide cache; the ingress can
//! demand an immediate refresh when it meets a table it has never heard of.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use granary_core::{Error, Result, StorageBackend};

/// Per-table ingest metadata from the allow-list document.
#[derive(Debug, Clone, Deserialize)]
pub struct TableMetadata {
    /// Whether fragments for this table should be loaded into the
    /// warehouse. Tables flagged `false` are acknowledged and dropped.
    #[serde(default = "default_true")]
    pub load_into_warehouse: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AllowListDocument {
    tables: HashMap<String, TableMetadata>,
}

/// Process-wide allow-list cache.
pub struct MetadataLoader {
    storage: Arc<dyn StorageBackend>,
    key: String,
    retry_delay: Duration,
    entries: RwLock<HashMap<String, TableMetadata>>,
}

impl MetadataLoader {
    /// Fetches the document, retrying up to `initial_attempts` times with
    /// `retry_delay` between attempts. Failure after the last attempt is
    /// fatal to the caller.
    pub async fn load(
        storage: Arc<dyn StorageBackend>,
        key: impl Into<String>,
        retry_delay: Duration,
        initial_attempts: u32,
    ) -> Result<Arc<Self>> {
        let loader = Arc::new(Self {
            storage,
            key: key.into(),
            retry_delay,
            entries: RwLock::new(HashMap::new()),
        });

        let attempts = initial_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match loader.refresh().await {
                Ok(()) => return Ok(loader),
                Err(error) => {
                    tracing::warn!(%error, attempt, "initial allow-list load failed");
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(loader.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Config("allow-list never became readable".to_string())))
    }

    async fn refresh(&self) -> Result<()> {
        let raw = self.storage.get(&self.key).await?;
        let document: AllowListDocument = serde_json::from_slice(&raw)
            .map_err(|e| Error::Serialization(format!("parsing allow-list document: {e}")))?;
        let count = document.tables.len();
        if let Ok(mut entries) = self.entries.write() {
            *entries = document.tables;
        }
        tracing::debug!(tables = count, "allow-list refreshed");
        Ok(())
    }

    /// Refreshes the cache now. Used when the ingress meets an unknown
    /// table.
    pub async fn force_reload(&self) -> Result<()> {
        self.refresh().await
    }

    /// Whether the allow-list mentions `table` at all.
    #[must_use]
    pub fn is_known(&self, table: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(table))
            .unwrap_or(false)
    }

    /// Whether fragments for `table` should reach the warehouse. Unknown
    /// tables are not loadable.
    #[must_use]
    pub fn load_into_warehouse(&self, table: &str) -> bool {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .get(table)
                    .is_some_and(|meta| meta.load_into_warehouse)
            })
            .unwrap_or(false)
    }

    /// Spawns the periodic refresh loop. Fetch errors shorten the next
    /// sleep to the retry delay; the loop only exits on cancellation.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("allow-list refresh loop started");
            loop {
                let sleep_for = match loader.refresh().await {
                    Ok(()) => period,
                    Err(error) => {
                        tracing::warn!(%error, "allow-list refresh failed");
                        loader.retry_delay
                    }
                };
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(sleep_for) => {}
                }
            }
            tracing::info!("allow-list refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use granary_core::MemoryBackend;

    const KEY: &str = "configs/ingest_tables.json";

    async fn storage_with(doc: &str) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(KEY, Bytes::from(doc.to_string()))
            .await
            .expect("put");
        backend
    }

    #[tokio::test]
    async fn loads_and_answers_queries() {
        let storage = storage_with(
            r#"{"tables": {
                "chat_message": {"load_into_warehouse": true},
                "debug_event": {"load_into_warehouse": false},
                "minute_watched": {}
            }}"#,
        )
        .await;
        let loader = MetadataLoader::load(storage, KEY, Duration::from_millis(1), 1)
            .await
            .expect("load");

        assert!(loader.is_known("chat_message"));
        assert!(loader.load_into_warehouse("chat_message"));
        assert!(loader.is_known("debug_event"));
        assert!(!loader.load_into_warehouse("debug_event"));
        // Omitted flag defaults to loadable.
        assert!(loader.load_into_warehouse("minute_watched"));
        assert!(!loader.is_known("mystery"));
        assert!(!loader.load_into_warehouse("mystery"));
    }

    #[tokio::test]
    async fn force_reload_picks_up_changes() {
        let storage = storage_with(r#"{"tables": {}}"#).await;
        let loader =
            MetadataLoader::load(Arc::clone(&storage) as Arc<dyn StorageBackend>, KEY, Duration::from_millis(1), 1)
                .await
                .expect("load");
        assert!(!loader.is_known("late_arrival"));

        storage
            .put(
                KEY,
                Bytes::from(r#"{"tables": {"late_arrival": {}}}"#.to_string()),
            )
            .await
            .expect("put");
        loader.force_reload().await.expect("reload");
        assert!(loader.is_known("late_arrival"));
    }

    #[tokio::test]
    async fn initial_load_retries_then_fails() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let result = MetadataLoader::load(backend, KEY, Duration::from_millis(1), 3).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_document_is_an_error() {
        let storage = storage_with("not json").await;
        let result = MetadataLoader::load(storage, KEY, Duration::from_millis(1), 1).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[tokio::test]
    async fn refresh_loop_applies_updates_and_stops() {
        let storage = storage_with(r#"{"tables": {}}"#).await;
        let loader =
            MetadataLoader::load(Arc::clone(&storage) as Arc<dyn StorageBackend>, KEY, Duration::from_millis(1), 1)
                .await
                .expect("load");

        let shutdown = CancellationToken::new();
        let handle = loader.spawn_refresh(Duration::from_millis(5), shutdown.clone());

        storage
            .put(
                KEY,
                Bytes::from(r#"{"tables": {"fresh": {}}}"#.to_string()),
            )
            .await
            .expect("put");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !loader.is_known("fresh") {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("refresh should land");

        shutdown.cancel();
        handle.await.expect("join");
    }
}
