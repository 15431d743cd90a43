//! # granary-metadata
//!
//! The durable spine of the ingestion pipeline: a transactional queue of
//! pending fragments, manifest assembly on count/age/force triggers, and
//! the load-state machine with crash recovery.
//!
//! The queue state lives in Postgres ([`PgMetadataStore`]); an in-memory
//! twin ([`MemoryMetadataStore`]) with identical semantics backs the test
//! suites. Both implement [`MetadataBackend`]. Ready manifests are streamed
//! to the worker pool by the dispenser task in [`dispenser`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod dispenser;
pub mod memory;
pub mod models;
pub mod pg;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use granary_core::{LoadChecker, Result, VersionCache};

pub use dispenser::{spawn_dispenser, DispenserConfig, LoadReady};
pub use memory::MemoryMetadataStore;
pub use models::{manifest_document, Fragment, Manifest, ManifestState, ManifestUploader};
pub use pg::PgMetadataStore;

/// What the loader process hands the store so `lease_ready` can assemble
/// manifests: somewhere to publish manifest documents, and the version
/// cache that decides which fragment version is loadable per table.
///
/// The storer process runs without one; it only inserts fragments.
#[derive(Clone)]
pub struct LoaderContext {
    /// Uploads manifest documents to object storage.
    pub uploader: ManifestUploader,
    /// The warehouse's current version per table. Assembly only gathers
    /// fragments at this version: newer fragments wait for the migrator,
    /// older stragglers are held for operator attention.
    pub versions: Arc<VersionCache>,
}

/// Trigger rule for turning queued fragments into manifests.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Queue depth at which a table's fragments are loaded regardless of age.
    pub count_trigger: usize,
    /// Age of the oldest queued fragment at which a load is triggered.
    pub age_trigger: Duration,
    /// Upper bound on fragments per manifest.
    pub max_fragments: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            count_trigger: 5,
            age_trigger: Duration::from_secs(1800),
            max_fragments: 500,
        }
    }
}

/// The metadata store: fragment queue, manifest assembly, load states.
///
/// Every mutation is transactional; manifest assembly and lease acquisition
/// are atomic so no fragment ever belongs to two live manifests and no two
/// workers ever lease the same manifest.
#[async_trait]
pub trait MetadataBackend: Send + Sync + 'static {
    /// Records a fragment pointer. Idempotent on the object URL: inserting
    /// a URL that is already queued is a silent success.
    async fn insert_load(&self, fragment: Fragment) -> Result<()>;

    /// Re-leases errored manifests and assembles new ones per the trigger
    /// rule, returning everything leased in state `Loading`, FIFO per table.
    ///
    /// Assembly gathers fragments at each table's current warehouse
    /// version. Fragments declaring a newer version are held until the
    /// migrator advances the table; older stragglers are held too.
    async fn lease_ready(&self, cfg: &AssemblyConfig) -> Result<Vec<Manifest>>;

    /// Completes a manifest: deletes it, its membership rows, and the
    /// fragments it loaded, in one transaction.
    async fn load_done(&self, uuid: Uuid) -> Result<()>;

    /// Records a retryable failure: back to `Pending`, attempts + 1,
    /// `last_error` recorded. The manifest becomes re-leasable.
    async fn load_error(&self, uuid: Uuid, reason: &str) -> Result<()>;

    /// Whether any fragment is still queued for `(table, version)`.
    async fn tsv_version_exists(&self, table: &str, version: i64) -> Result<bool>;

    /// Requests an immediate load (and on-peak migration permission) for
    /// `table`. Idempotent.
    async fn force_load(&self, table: &str, requested_by: &str) -> Result<()>;

    /// Whether a force-load request is pending for `table`.
    async fn is_force_load_requested(&self, table: &str) -> Result<bool>;

    /// For each table with queued fragments, the highest declared version.
    async fn versions(&self) -> Result<HashMap<String, i64>>;

    /// Tables with at least one queued fragment.
    async fn list_distinct_tables(&self) -> Result<Vec<String>>;

    /// Reconciles manifests left in `Loading` by a crash: `Complete` loads
    /// finish, `Failed`/`NotFound` loads reset to `Pending`, `InProgress`
    /// loads are left for their worker.
    async fn recover_in_flight(&self, checker: &dyn LoadChecker) -> Result<()>;

    /// Lightweight liveness probe for the health endpoint.
    async fn health_check(&self) -> Result<()>;
}
