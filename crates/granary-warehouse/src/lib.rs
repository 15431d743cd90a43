//! # granary-warehouse
//!
//! Typed operations against the columnar warehouse: manifest COPY, schema
//! DDL, version introspection, lock probing, and transaction-log inspection
//! for recovering the outcome of in-flight loads.
//!
//! The warehouse speaks the Postgres wire protocol but has its own bulk-load
//! semantics and system catalogs; everything idiosyncratic is kept behind
//! [`Warehouse`] so the workers and migrator never see SQL.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod adapter;
pub mod copy;
pub mod ddl;
mod load_status;
pub mod locks;
pub mod memory;
pub mod ops;

use std::collections::HashMap;

use async_trait::async_trait;

use granary_core::Result;

pub use adapter::RedshiftWarehouse;
pub use copy::{
    CachedCredentials, CopyCredentials, CopySource, CredentialsProvider, EnvCredentials,
};
pub use memory::MemoryWarehouse;
pub use ops::{Action, Operation};

/// Typed surface over the columnar warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Pings the warehouse; used by the health endpoint.
    async fn health_check(&self) -> Result<()>;

    /// Runs a manifest COPY into `table` inside a transaction, holding the
    /// per-table lock for the duration.
    async fn manifest_copy(&self, table: &str, manifest_url: &str) -> Result<()>;

    /// Current version of every table known to `infra.table_version`.
    async fn table_versions(&self) -> Result<HashMap<String, i64>>;

    /// Whether `table` exists as an ordinary relation in the `logs` schema.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Whether any warehouse-side lock is outstanding on `table`.
    async fn table_locked(&self, table: &str) -> Result<bool>;

    /// Creates `table` from a homogeneous ADD-column operation list and
    /// records its initial version, in one transaction.
    ///
    /// A `DropEvent` sentinel in the list makes this a no-op success.
    async fn create_table(&self, table: &str, ops: &[Operation], version: i64) -> Result<()>;

    /// Applies `ops` in order and advances the version history to
    /// `target_version`, all in one transaction under the per-table lock.
    ///
    /// Fails if the current version is not `target_version - 1`.
    async fn apply_operations(
        &self,
        table: &str,
        ops: &[Operation],
        target_version: i64,
        timeout_ms: i64,
    ) -> Result<()>;
}
