//! In-memory metadata store with the same semantics as the Postgres one.
//!
//! Backs the worker, migrator, ingress, and property test suites. A single
//! async mutex stands in for the database's transactions; every operation
//! observes and mutates a consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use granary_core::{Error, LoadChecker, LoadStatus, MemoryBackend, Result, VersionCache};

use crate::models::{Fragment, Manifest, ManifestState, ManifestUploader};
use crate::{AssemblyConfig, LoaderContext, MetadataBackend};

#[derive(Debug, Clone)]
struct ManifestRecord {
    manifest: Manifest,
    state: ManifestState,
}

#[derive(Default)]
struct Inner {
    fragments: Vec<Fragment>,
    /// URL -> owning live manifest.
    assigned: HashMap<String, Uuid>,
    manifests: HashMap<Uuid, ManifestRecord>,
    force_load: HashMap<String, String>,
}

/// In-memory [`MetadataBackend`] implementation.
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
    loader: LoaderContext,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    /// Creates a store with its own version cache, uploading manifest
    /// documents to its own memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_versions(Arc::new(VersionCache::default()))
    }

    /// Creates a store sharing `versions` with the rest of the process.
    #[must_use]
    pub fn with_versions(versions: Arc<VersionCache>) -> Self {
        Self::with_loader(LoaderContext {
            uploader: ManifestUploader::new(Arc::new(MemoryBackend::named("manifests")), "loads"),
            versions,
        })
    }

    /// Creates a store with an explicit loader context.
    #[must_use]
    pub fn with_loader(loader: LoaderContext) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            loader,
        }
    }

    /// The version cache assembly consults. Tests seed current versions
    /// through this handle.
    #[must_use]
    pub fn versions_handle(&self) -> Arc<VersionCache> {
        Arc::clone(&self.loader.versions)
    }

    /// The state of a manifest, if it is still live. Test helper.
    pub async fn manifest_state(&self, uuid: Uuid) -> Option<ManifestState> {
        self.inner
            .lock()
            .await
            .manifests
            .get(&uuid)
            .map(|r| r.state)
    }

    /// Queued fragment count. Test helper.
    pub async fn fragment_count(&self) -> usize {
        self.inner.lock().await.fragments.len()
    }

    /// Live manifest count. Test helper.
    pub async fn manifest_count(&self) -> usize {
        self.inner.lock().await.manifests.len()
    }

    /// Parks a manifest directly in `Loading`, as a crash would leave it.
    /// Test helper for recovery scenarios.
    pub async fn park_loading_manifest(&self, manifest: Manifest) {
        let mut inner = self.inner.lock().await;
        for url in &manifest.urls {
            inner.assigned.insert(url.clone(), manifest.uuid);
        }
        inner.manifests.insert(
            manifest.uuid,
            ManifestRecord {
                manifest,
                state: ManifestState::Loading,
            },
        );
    }
}

#[async_trait]
impl MetadataBackend for MemoryMetadataStore {
    async fn insert_load(&self, fragment: Fragment) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fragments.iter().any(|f| f.url == fragment.url) {
            return Ok(());
        }
        inner.fragments.push(fragment);
        Ok(())
    }

    async fn lease_ready(&self, cfg: &AssemblyConfig) -> Result<Vec<Manifest>> {
        let mut inner = self.inner.lock().await;
        let mut leased = Vec::new();

        // Re-lease errored manifests first, oldest first.
        let mut pending: Vec<Uuid> = inner
            .manifests
            .values()
            .filter(|r| r.state == ManifestState::Pending)
            .map(|r| r.manifest.uuid)
            .collect();
        pending.sort_by_key(|uuid| inner.manifests[uuid].manifest.created_at);
        for uuid in pending {
            if let Some(record) = inner.manifests.get_mut(&uuid) {
                record.state = ManifestState::Loading;
                leased.push(record.manifest.clone());
            }
        }

        // Find tables with unassigned fragments at their current warehouse
        // version; other versions are held.
        let mut tables: Vec<(String, i64)> = Vec::new();
        for fragment in inner
            .fragments
            .iter()
            .filter(|f| !inner.assigned.contains_key(&f.url))
        {
            if self.loader.versions.get(&fragment.table_name) == Some(fragment.version)
                && !tables.iter().any(|(t, _)| t == &fragment.table_name)
            {
                tables.push((fragment.table_name.clone(), fragment.version));
            }
        }
        tables.sort();

        let age_cutoff = Utc::now()
            - chrono::Duration::from_std(cfg.age_trigger)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        for (table, version) in tables {
            let mut members: Vec<&Fragment> = inner
                .fragments
                .iter()
                .filter(|f| {
                    f.table_name == table
                        && f.version == version
                        && !inner.assigned.contains_key(&f.url)
                })
                .collect();
            members.sort_by_key(|f| f.received_at);

            let forced = inner.force_load.contains_key(&table);
            let oldest = members.first().map(|f| f.received_at);
            let triggered = forced
                || members.len() >= cfg.count_trigger
                || oldest.is_some_and(|ts| ts <= age_cutoff);
            if !triggered {
                continue;
            }

            let urls: Vec<String> = members
                .into_iter()
                .take(cfg.max_fragments)
                .map(|f| f.url.clone())
                .collect();
            if urls.is_empty() {
                continue;
            }

            let uuid = Uuid::new_v4();
            let manifest_url = self.loader.uploader.upload(uuid, &urls).await?;
            let manifest = Manifest {
                uuid,
                table_name: table.clone(),
                urls: urls.clone(),
                manifest_url,
                attempts: 0,
                last_error: None,
                created_at: Utc::now(),
            };
            for url in &urls {
                inner.assigned.insert(url.clone(), uuid);
            }
            inner.manifests.insert(
                uuid,
                ManifestRecord {
                    manifest: manifest.clone(),
                    state: ManifestState::Loading,
                },
            );
            inner.force_load.remove(&table);
            leased.push(manifest);
        }

        Ok(leased)
    }

    async fn load_done(&self, uuid: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.manifests.remove(&uuid) else {
            return Err(Error::NotFound(format!("manifest {uuid}")));
        };
        for url in &record.manifest.urls {
            inner.assigned.remove(url);
        }
        inner
            .fragments
            .retain(|f| !record.manifest.urls.contains(&f.url));
        Ok(())
    }

    async fn load_error(&self, uuid: Uuid, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.manifests.get_mut(&uuid) else {
            return Err(Error::NotFound(format!("manifest {uuid}")));
        };
        record.state = ManifestState::Pending;
        record.manifest.attempts += 1;
        record.manifest.last_error = Some(reason.to_string());
        Ok(())
    }

    async fn tsv_version_exists(&self, table: &str, version: i64) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fragments
            .iter()
            .any(|f| f.table_name == table && f.version == version))
    }

    async fn force_load(&self, table: &str, requested_by: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .force_load
            .entry(table.to_string())
            .or_insert_with(|| requested_by.to_string());
        Ok(())
    }

    async fn is_force_load_requested(&self, table: &str) -> Result<bool> {
        Ok(self.inner.lock().await.force_load.contains_key(table))
    }

    async fn versions(&self) -> Result<HashMap<String, i64>> {
        let inner = self.inner.lock().await;
        let mut versions = HashMap::new();
        for fragment in &inner.fragments {
            let entry = versions
                .entry(fragment.table_name.clone())
                .or_insert(fragment.version);
            *entry = (*entry).max(fragment.version);
        }
        Ok(versions)
    }

    async fn list_distinct_tables(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut tables: Vec<String> = inner
            .fragments
            .iter()
            .map(|f| f.table_name.clone())
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    async fn recover_in_flight(&self, checker: &dyn LoadChecker) -> Result<()> {
        let loading: Vec<(Uuid, String)> = {
            let inner = self.inner.lock().await;
            inner
                .manifests
                .values()
                .filter(|r| r.state == ManifestState::Loading)
                .map(|r| (r.manifest.uuid, r.manifest.manifest_url.clone()))
                .collect()
        };

        for (uuid, manifest_url) in loading {
            let status = checker.check_load_status(&manifest_url).await?;
            tracing::info!(
                manifest_uuid = %uuid,
                status = status.as_str(),
                "reconciling in-flight manifest"
            );
            match status {
                LoadStatus::Complete => self.load_done(uuid).await?,
                LoadStatus::Failed | LoadStatus::NotFound => {
                    let mut inner = self.inner.lock().await;
                    if let Some(record) = inner.manifests.get_mut(&uuid) {
                        record.state = ManifestState::Pending;
                    }
                }
                LoadStatus::InProgress => {}
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.inner.lock().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn cfg(count: usize, age_secs: u64) -> AssemblyConfig {
        AssemblyConfig {
            count_trigger: count,
            age_trigger: Duration::from_secs(age_secs),
            max_fragments: 500,
        }
    }

    /// A store whose version cache says `table` is currently at `version`.
    fn store_at(table: &str, version: i64) -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        store.versions_handle().set(table, version);
        store
    }

    fn fragment(table: &str, url: &str, version: i64) -> Fragment {
        Fragment::new(table, url, version)
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_url() {
        let store = store_at("t", 1);
        store
            .insert_load(fragment("t", "s3://f/a", 1))
            .await
            .expect("insert");
        store
            .insert_load(fragment("t", "s3://f/a", 1))
            .await
            .expect("duplicate insert");
        assert_eq!(store.fragment_count().await, 1);
    }

    #[tokio::test]
    async fn count_trigger_assembles_one_manifest() {
        let store = store_at("t", 2);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 2))
                .await
                .expect("insert");
        }

        let leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].table_name, "t");
        assert_eq!(leased[0].urls.len(), 3);

        // Nothing left unassigned: a second pass leases nothing.
        assert!(store
            .lease_ready(&cfg(3, 3600))
            .await
            .expect("lease")
            .is_empty());
    }

    #[tokio::test]
    async fn below_count_trigger_waits() {
        let store = store_at("t", 2);
        store
            .insert_load(fragment("t", "s3://f/0", 2))
            .await
            .expect("insert");
        assert!(store
            .lease_ready(&cfg(3, 3600))
            .await
            .expect("lease")
            .is_empty());
    }

    #[tokio::test]
    async fn age_trigger_assembles_single_old_fragment() {
        let store = store_at("t", 2);
        let mut old = fragment("t", "s3://f/old", 2);
        old.received_at = Utc::now() - ChronoDuration::seconds(5);
        store.insert_load(old).await.expect("insert");

        let leased = store.lease_ready(&cfg(100, 1)).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].urls, vec!["s3://f/old".to_string()]);
    }

    #[tokio::test]
    async fn force_load_triggers_and_clears() {
        let store = store_at("t", 2);
        store
            .insert_load(fragment("t", "s3://f/0", 2))
            .await
            .expect("insert");
        store.force_load("t", "operator").await.expect("force");
        assert!(store.is_force_load_requested("t").await.expect("probe"));

        let leased = store.lease_ready(&cfg(100, 3600)).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert!(!store.is_force_load_requested("t").await.expect("probe"));
    }

    #[tokio::test]
    async fn only_the_current_version_assembles() {
        let store = store_at("t", 4);
        store
            .insert_load(fragment("t", "s3://f/v4-a", 4))
            .await
            .expect("insert");
        store
            .insert_load(fragment("t", "s3://f/v5-a", 5))
            .await
            .expect("insert");
        store
            .insert_load(fragment("t", "s3://f/v5-b", 5))
            .await
            .expect("insert");

        let leased = store.lease_ready(&cfg(1, 3600)).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].urls, vec!["s3://f/v4-a".to_string()]);
        // The newer fragments wait for the migrator.
        assert!(store.tsv_version_exists("t", 5).await.expect("probe"));
    }

    #[tokio::test]
    async fn newer_versions_wait_for_migration() {
        let store = store_at("t", 4);
        store
            .insert_load(fragment("t", "s3://f/v5", 5))
            .await
            .expect("insert");
        store.force_load("t", "operator").await.expect("force");
        assert!(store
            .lease_ready(&cfg(1, 3600))
            .await
            .expect("lease")
            .is_empty());

        // The migrator advances the table; the fragments become loadable.
        store.versions_handle().set("t", 5);
        let leased = store.lease_ready(&cfg(1, 3600)).await.expect("lease");
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tables_never_assemble() {
        let store = MemoryMetadataStore::new();
        store
            .insert_load(fragment("uncreated", "s3://f/0", 0))
            .await
            .expect("insert");
        assert!(store
            .lease_ready(&cfg(1, 3600))
            .await
            .expect("lease")
            .is_empty());
    }

    #[tokio::test]
    async fn manifest_size_is_bounded() {
        let store = store_at("t", 1);
        for i in 0..7 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                .await
                .expect("insert");
        }
        let mut config = cfg(3, 3600);
        config.max_fragments = 4;
        let leased = store.lease_ready(&config).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].urls.len(), 4);
    }

    #[tokio::test]
    async fn load_done_deletes_everything() {
        let store = store_at("t", 1);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                .await
                .expect("insert");
        }
        let leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        store.load_done(leased[0].uuid).await.expect("done");
        assert_eq!(store.fragment_count().await, 0);
        assert_eq!(store.manifest_count().await, 0);
        assert!(store.versions().await.expect("versions").is_empty());
    }

    #[tokio::test]
    async fn load_error_makes_manifest_releasable() {
        let store = store_at("t", 1);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                .await
                .expect("insert");
        }
        let first = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        store
            .load_error(first[0].uuid, "connection reset")
            .await
            .expect("error");

        let second = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].uuid, first[0].uuid);
        assert_eq!(second[0].attempts, 1);
        assert_eq!(second[0].last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn errored_manifests_lease_before_new_ones() {
        let store = store_at("t", 1);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/old{i}"), 1))
                .await
                .expect("insert");
        }
        let first = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        store.load_error(first[0].uuid, "busy").await.expect("error");

        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/new{i}"), 1))
                .await
                .expect("insert");
        }
        let leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].uuid, first[0].uuid);
    }

    struct FixedChecker(LoadStatus);

    #[async_trait]
    impl LoadChecker for FixedChecker {
        async fn check_load_status(&self, _manifest_url: &str) -> Result<LoadStatus> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn recovery_completes_committed_loads() {
        let store = store_at("t", 1);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                .await
                .expect("insert");
        }
        let _leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");

        store
            .recover_in_flight(&FixedChecker(LoadStatus::Complete))
            .await
            .expect("recover");
        assert_eq!(store.manifest_count().await, 0);
        assert_eq!(store.fragment_count().await, 0);
    }

    #[tokio::test]
    async fn recovery_resets_failed_and_missing_loads() {
        for status in [LoadStatus::Failed, LoadStatus::NotFound] {
            let store = store_at("t", 1);
            for i in 0..3 {
                store
                    .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                    .await
                    .expect("insert");
            }
            let leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
            store
                .recover_in_flight(&FixedChecker(status))
                .await
                .expect("recover");
            assert_eq!(
                store.manifest_state(leased[0].uuid).await,
                Some(ManifestState::Pending)
            );
        }
    }

    #[tokio::test]
    async fn recovery_leaves_in_progress_loads() {
        let store = store_at("t", 1);
        for i in 0..3 {
            store
                .insert_load(fragment("t", &format!("s3://f/{i}"), 1))
                .await
                .expect("insert");
        }
        let leased = store.lease_ready(&cfg(3, 3600)).await.expect("lease");
        store
            .recover_in_flight(&FixedChecker(LoadStatus::InProgress))
            .await
            .expect("recover");
        assert_eq!(
            store.manifest_state(leased[0].uuid).await,
            Some(ManifestState::Loading)
        );
    }
}
