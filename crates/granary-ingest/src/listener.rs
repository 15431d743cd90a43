//! The listener pool: queue deliveries in, fragment rows out.
//!
//! Per delivery: dedup filter, signature/parse, allow-list admission
//! (with a forced reload for unknown tables), then an idempotent insert
//! into the metadata store. Acknowledged deliveries are deleted from the
//! queue; failed ones are left for redelivery.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use granary_core::Result;
use granary_metadata::{Fragment, MetadataBackend};
use granary_registry::MetadataLoader;

use crate::dedup::DedupFilter;
use crate::metrics;
use crate::queue::{QueueConsumer, QueueMessage};
use crate::request::RequestVerifier;

/// Listener pool tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Long-poll wait per receive call.
    pub poll_wait: Duration,
    /// Max deliveries per receive call.
    pub max_messages: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(30),
            max_messages: 10,
        }
    }
}

/// What to do with a delivery after handling it.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Delete the delivery from the queue.
    Ack,
    /// Leave it for redelivery.
    Retry,
}

/// The shared ingress state behind the listener pool.
pub struct Ingress {
    queue: Arc<dyn QueueConsumer>,
    store: Arc<dyn MetadataBackend>,
    allowlist: Arc<MetadataLoader>,
    verifier: Arc<dyn RequestVerifier>,
    filter: DedupFilter,
    /// Tables this process has already admitted; a miss here is the cue to
    /// refresh the allow-list before rejecting.
    known_tables: RwLock<HashSet<String>>,
    config: ListenerConfig,
}

impl Ingress {
    /// Builds the ingress, seeding the known-table set from the tables
    /// already queued in the metadata store.
    pub async fn new(
        queue: Arc<dyn QueueConsumer>,
        store: Arc<dyn MetadataBackend>,
        allowlist: Arc<MetadataLoader>,
        verifier: Arc<dyn RequestVerifier>,
        filter: DedupFilter,
        config: ListenerConfig,
    ) -> Result<Arc<Self>> {
        let known: HashSet<String> = store.list_distinct_tables().await?.into_iter().collect();
        Ok(Arc::new(Self {
            queue,
            store,
            allowlist,
            verifier,
            filter,
            known_tables: RwLock::new(known),
            config,
        }))
    }

    /// Spawns `count` listener loops sharing this ingress.
    pub fn spawn_listeners(
        self: &Arc<Self>,
        count: usize,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|index| {
                let ingress = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(listener = index, "queue listener started");
                    ingress.run(shutdown).await;
                    tracing::info!(listener = index, "queue listener stopped");
                })
            })
            .collect()
    }

    async fn run(&self, shutdown: CancellationToken) {
        loop {
            let batch = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.queue.receive(self.config.max_messages, self.config.poll_wait) => {
                    match received {
                        Ok(batch) => batch,
                        Err(error) => {
                            tracing::warn!(%error, "queue receive failed");
                            metrics::record_error("receive");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
            };

            for message in batch {
                match self.handle_delivery(&message).await {
                    Disposition::Ack => {
                        if let Err(error) = self.queue.acknowledge(&message).await {
                            tracing::warn!(%error, message_id = %message.id, "acknowledge failed");
                            metrics::record_error("acknowledge");
                        }
                    }
                    Disposition::Retry => {}
                }
            }
        }
    }

    /// Runs one delivery through the admission pipeline.
    async fn handle_delivery(&self, message: &QueueMessage) -> Disposition {
        tracing::debug!(message_id = %message.id, "received message");

        if !self.filter.observe(&message.id) {
            tracing::debug!(message_id = %message.id, "dropping replayed delivery");
            metrics::record_duplicate();
            return Disposition::Ack;
        }

        let request = match self.verifier.verify_and_parse(&message.body) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!(%error, message_id = %message.id, "rejecting unreadable delivery");
                metrics::record_error("verify");
                return Disposition::Retry;
            }
        };
        let table = request.table_name.clone();

        let already_known = self
            .known_tables
            .read()
            .map(|known| known.contains(&table))
            .unwrap_or(false);
        if !already_known {
            if let Err(error) = self.allowlist.force_reload().await {
                tracing::warn!(%error, table, "allow-list reload for unknown table failed");
            }
        }
        if !self.allowlist.is_known(&table) {
            tracing::error!(table, "no metadata found for table after forced refresh");
            metrics::record_error("admission");
            return Disposition::Retry;
        }
        if let Ok(mut known) = self.known_tables.write() {
            known.insert(table.clone());
        }

        if !self.allowlist.load_into_warehouse(&table) {
            metrics::record_fragment(&table, "skipped_unroutable");
            return Disposition::Ack;
        }

        metrics::record_fragment(&table, "received");

        let fragment = Fragment::new(&table, request.object_url(), request.table_version);
        if let Err(error) = self.store.insert_load(fragment).await {
            tracing::error!(%error, table, "fragment insert failed");
            metrics::record_error("insert");
            return Disposition::Retry;
        }

        metrics::record_fragment(&table, "queued");
        Disposition::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use granary_core::{MemoryBackend, StorageBackend};
    use granary_metadata::MemoryMetadataStore;
    use granary_registry::MetadataLoader;

    use crate::queue::MemoryQueue;
    use crate::request::{HmacVerifier, RowCopyRequest};

    const ALLOWLIST_KEY: &str = "configs/ingest_tables.json";

    struct Fixture {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryMetadataStore>,
        storage: Arc<MemoryBackend>,
        ingress: Arc<Ingress>,
        signer: HmacVerifier,
    }

    async fn fixture(allowlist: &str) -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .put(ALLOWLIST_KEY, Bytes::from(allowlist.to_string()))
            .await
            .expect("put");
        let loader = MetadataLoader::load(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            ALLOWLIST_KEY,
            Duration::from_millis(1),
            1,
        )
        .await
        .expect("loader");

        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryMetadataStore::new());
        let ingress = Ingress::new(
            Arc::clone(&queue) as Arc<dyn QueueConsumer>,
            Arc::clone(&store) as Arc<dyn MetadataBackend>,
            loader,
            Arc::new(HmacVerifier::new(*b"shared-secret")),
            DedupFilter::new(1000, Duration::from_secs(3600)),
            ListenerConfig {
                poll_wait: Duration::ZERO,
                max_messages: 10,
            },
        )
        .await
        .expect("ingress");

        Fixture {
            queue,
            store,
            storage,
            ingress,
            signer: HmacVerifier::new(*b"shared-secret"),
        }
    }

    fn message(signer: &HmacVerifier, id: &str, table: &str, key: &str, version: i64) -> QueueMessage {
        let body = signer
            .sign(&RowCopyRequest {
                table_name: table.to_string(),
                key_name: key.to_string(),
                table_version: version,
            })
            .expect("sign");
        QueueMessage {
            id: id.to_string(),
            receipt: format!("receipt-{id}"),
            body,
        }
    }

    #[tokio::test]
    async fn admitted_fragment_is_queued() {
        let f = fixture(r#"{"tables": {"chat_message": {}}}"#).await;
        let msg = message(&f.signer, "m1", "chat_message", "frags/0001.tsv.gz", 4);

        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Ack);
        assert_eq!(f.store.fragment_count().await, 1);
        let versions = f.store.versions().await.expect("versions");
        assert_eq!(versions.get("chat_message"), Some(&4));
    }

    #[tokio::test]
    async fn replayed_message_id_inserts_once() {
        let f = fixture(r#"{"tables": {"chat_message": {}}}"#).await;
        let msg = message(&f.signer, "m1", "chat_message", "frags/0001.tsv.gz", 4);

        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Ack);
        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Ack);
        assert_eq!(f.store.fragment_count().await, 1);
    }

    #[tokio::test]
    async fn do_not_load_tables_are_acked_and_dropped() {
        let f = fixture(
            r#"{"tables": {"debug_event": {"load_into_warehouse": false}}}"#,
        )
        .await;
        let msg = message(&f.signer, "m1", "debug_event", "frags/0001.tsv.gz", 1);

        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Ack);
        assert_eq!(f.store.fragment_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_table_forces_reload_then_admits() {
        let f = fixture(r#"{"tables": {}}"#).await;
        // The table appears in the document after the ingress started.
        f.storage
            .put(
                ALLOWLIST_KEY,
                Bytes::from(r#"{"tables": {"late_table": {}}}"#.to_string()),
            )
            .await
            .expect("put");

        let msg = message(&f.signer, "m1", "late_table", "frags/0001.tsv.gz", 0);
        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Ack);
        assert_eq!(f.store.fragment_count().await, 1);
    }

    #[tokio::test]
    async fn still_unknown_table_is_retried() {
        let f = fixture(r#"{"tables": {}}"#).await;
        let msg = message(&f.signer, "m1", "mystery", "frags/0001.tsv.gz", 0);
        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Retry);
        assert_eq!(f.store.fragment_count().await, 0);
    }

    #[tokio::test]
    async fn bad_signature_is_retried() {
        let f = fixture(r#"{"tables": {"chat_message": {}}}"#).await;
        let forged = HmacVerifier::new(*b"wrong-secret!");
        let msg = message(&forged, "m1", "chat_message", "frags/0001.tsv.gz", 4);
        assert_eq!(f.ingress.handle_delivery(&msg).await, Disposition::Retry);
    }

    #[tokio::test]
    async fn listener_loop_drains_the_queue() {
        let f = fixture(r#"{"tables": {"chat_message": {}}}"#).await;
        for i in 0..3 {
            let msg = message(
                &f.signer,
                &format!("m{i}"),
                "chat_message",
                &format!("frags/{i:04}.tsv.gz"),
                4,
            );
            f.queue.push(msg.id.clone(), msg.body.clone());
        }

        let shutdown = CancellationToken::new();
        let handles = f.ingress.spawn_listeners(2, &shutdown);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.store.fragment_count().await < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fragments should land");

        shutdown.cancel();
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(f.queue.acked().len(), 3);
    }
}
