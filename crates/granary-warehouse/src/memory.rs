//! In-memory warehouse for tests and hermetic development.
//!
//! Mirrors the semantics the adapter gets from the real warehouse: the
//! version history and the relation catalog are separate (a version-only
//! bump leaves `table_exists` false), creation short-circuits on the
//! `DropEvent` sentinel, COPY and DDL serialize per table, and the
//! load-status probe is scriptable for crash-recovery scenarios.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use granary_core::{Error, LoadChecker, LoadStatus, Result};

use crate::ddl::reject_nul;
use crate::locks::TableLocks;
use crate::ops::{Action, Operation};
use crate::Warehouse;

/// A COPY the memory warehouse has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    /// Target table.
    pub table: String,
    /// Manifest URL the COPY referenced.
    pub manifest_url: String,
}

#[derive(Debug, Default)]
struct Inner {
    /// `infra.table_version` equivalent: highest version per name.
    versions: HashMap<String, i64>,
    /// Relation catalog equivalent: existing tables and their columns.
    relations: HashMap<String, Vec<String>>,
    copies: Vec<CopyRecord>,
    applied_timeouts: Vec<i64>,
    locked: HashSet<String>,
    load_statuses: HashMap<String, LoadStatus>,
    fail_copies_matching: Option<(String, bool)>,
    healthy: bool,
}

/// In-memory [`Warehouse`] implementation.
#[derive(Debug)]
pub struct MemoryWarehouse {
    inner: Mutex<Inner>,
    locks: TableLocks,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    /// Creates an empty, healthy warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                healthy: true,
                ..Inner::default()
            }),
            locks: TableLocks::new(),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seeds an existing table at a version without going through
    /// `create_table`.
    pub fn seed_table(&self, table: &str, version: i64) {
        let mut inner = self.lock_inner();
        inner.versions.insert(table.to_string(), version);
        inner.relations.insert(table.to_string(), Vec::new());
    }

    /// All COPYies accepted so far, in order.
    #[must_use]
    pub fn copies(&self) -> Vec<CopyRecord> {
        self.lock_inner().copies.clone()
    }

    /// Column names of `table`, if the relation exists.
    #[must_use]
    pub fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.lock_inner().relations.get(table).cloned()
    }

    /// Statement timeouts passed to `apply_operations`, in call order.
    #[must_use]
    pub fn applied_timeouts(&self) -> Vec<i64> {
        self.lock_inner().applied_timeouts.clone()
    }

    /// Marks `table` as holding a warehouse-side lock.
    pub fn set_locked(&self, table: &str, locked: bool) {
        let mut inner = self.lock_inner();
        if locked {
            inner.locked.insert(table.to_string());
        } else {
            inner.locked.remove(table);
        }
    }

    /// Scripts the answer `check_load_status` gives for `manifest_url`.
    pub fn set_load_status(&self, manifest_url: &str, status: LoadStatus) {
        self.lock_inner()
            .load_statuses
            .insert(manifest_url.to_string(), status);
    }

    /// Makes COPYies whose manifest URL contains `needle` fail;
    /// `retryable` picks the failure class.
    pub fn fail_copies_matching(&self, needle: &str, retryable: bool) {
        self.lock_inner().fail_copies_matching = Some((needle.to_string(), retryable));
    }

    /// Clears any scripted COPY failure.
    pub fn clear_copy_failures(&self) {
        self.lock_inner().fail_copies_matching = None;
    }

    /// Flips the health-check outcome.
    pub fn set_healthy(&self, healthy: bool) {
        self.lock_inner().healthy = healthy;
    }

    fn expect_version(inner: &Inner, table: &str, expected: i64, allow_fresh: bool) -> Result<()> {
        match inner.versions.get(table) {
            None if expected == -1 || allow_fresh => Ok(()),
            None => Err(Error::PreconditionFailed {
                message: format!(
                    "expected version {expected} for table {table}, but the table has no version history"
                ),
            }),
            Some(&found) if found == expected => Ok(()),
            Some(&found) => Err(Error::PreconditionFailed {
                message: format!("expected version {expected} for table {table}, found {found}"),
            }),
        }
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn health_check(&self) -> Result<()> {
        if self.lock_inner().healthy {
            Ok(())
        } else {
            Err(Error::warehouse_retryable("warehouse is unreachable"))
        }
    }

    async fn manifest_copy(&self, table: &str, manifest_url: &str) -> Result<()> {
        reject_nul("table name", table)?;
        reject_nul("manifest url", manifest_url)?;

        let lock = self.locks.for_table(table);
        let _guard = lock.lock().await;

        let mut inner = self.lock_inner();
        if let Some((needle, retryable)) = inner.fail_copies_matching.clone() {
            if manifest_url.contains(&needle) {
                return Err(if retryable {
                    Error::warehouse_retryable(format!("scripted copy failure for {manifest_url}"))
                } else {
                    Error::warehouse_permanent(format!("scripted copy failure for {manifest_url}"))
                });
            }
        }
        if !inner.relations.contains_key(table) {
            return Err(Error::warehouse_permanent(format!(
                "table {table} does not exist"
            )));
        }
        inner.copies.push(CopyRecord {
            table: table.to_string(),
            manifest_url: manifest_url.to_string(),
        });
        inner
            .load_statuses
            .insert(manifest_url.to_string(), LoadStatus::Complete);
        Ok(())
    }

    async fn table_versions(&self) -> Result<HashMap<String, i64>> {
        Ok(self.lock_inner().versions.clone())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.lock_inner().relations.contains_key(table))
    }

    async fn table_locked(&self, table: &str) -> Result<bool> {
        Ok(self.lock_inner().locked.contains(table))
    }

    async fn create_table(&self, table: &str, ops: &[Operation], version: i64) -> Result<()> {
        if ops.iter().any(|op| op.action == Action::DropEvent) {
            return Ok(());
        }

        let lock = self.locks.for_table(table);
        let _guard = lock.lock().await;

        let mut inner = self.lock_inner();
        if inner.relations.contains_key(table) {
            return Err(Error::warehouse_permanent(format!(
                "table {table} already exists"
            )));
        }
        let mut columns = Vec::with_capacity(ops.len());
        for op in ops {
            if op.action != Action::Add {
                return Err(Error::InvalidInput(format!(
                    "table creation requires add operations, got {:?}",
                    op.action
                )));
            }
            columns.push(op.column.clone());
        }
        inner.relations.insert(table.to_string(), columns);
        inner.versions.insert(table.to_string(), version);
        Ok(())
    }

    async fn apply_operations(
        &self,
        table: &str,
        ops: &[Operation],
        target_version: i64,
        timeout_ms: i64,
    ) -> Result<()> {
        let lock = self.locks.for_table(table);
        let _guard = lock.lock().await;

        let mut inner = self.lock_inner();
        Self::expect_version(&inner, table, target_version - 1, ops.is_empty())?;
        inner.applied_timeouts.push(timeout_ms);

        if let Some(columns) = inner.relations.get_mut(table) {
            for op in ops {
                match op.action {
                    Action::Add => columns.push(op.column.clone()),
                    Action::Delete => columns.retain(|c| c != &op.column),
                    Action::Rename => {
                        if let Some(new_name) = op.metadata.get("new_outbound") {
                            for column in columns.iter_mut() {
                                if column == &op.column {
                                    *column = new_name.clone();
                                }
                            }
                        }
                    }
                    Action::RequestDropEvent | Action::DropEvent | Action::CancelDropEvent => {}
                }
            }
        }
        inner.versions.insert(table.to_string(), target_version);
        Ok(())
    }
}

#[async_trait]
impl LoadChecker for MemoryWarehouse {
    async fn check_load_status(&self, manifest_url: &str) -> Result<LoadStatus> {
        Ok(self
            .lock_inner()
            .load_statuses
            .get(manifest_url)
            .copied()
            .unwrap_or(LoadStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_versions() {
        let wh = MemoryWarehouse::new();
        wh.create_table(
            "chat_message",
            &[Operation::add("time", "f@timestamp@utc")],
            0,
        )
        .await
        .expect("create");
        let versions = wh.table_versions().await.expect("versions");
        assert_eq!(versions.get("chat_message"), Some(&0));
        assert!(wh.table_exists("chat_message").await.expect("exists"));
    }

    #[tokio::test]
    async fn drop_event_creation_is_noop() {
        let wh = MemoryWarehouse::new();
        let ops = vec![Operation {
            action: Action::DropEvent,
            column: String::new(),
            metadata: HashMap::new(),
        }];
        wh.create_table("gone", &ops, 0).await.expect("noop");
        assert!(!wh.table_exists("gone").await.expect("exists"));
    }

    #[tokio::test]
    async fn apply_operations_enforces_version_precondition() {
        let wh = MemoryWarehouse::new();
        wh.seed_table("t", 4);
        let err = wh
            .apply_operations("t", &[], 4, 5_000)
            .await
            .expect_err("version gap");
        assert!(matches!(err, Error::PreconditionFailed { .. }));
        wh.apply_operations("t", &[Operation::add("c", "int")], 5, 5_000)
            .await
            .expect("apply");
        assert_eq!(wh.table_versions().await.expect("versions")["t"], 5);
        assert_eq!(wh.columns("t").expect("columns"), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn version_bump_does_not_create_relation() {
        let wh = MemoryWarehouse::new();
        // Op-less increments may jump a fresh table to any version.
        wh.apply_operations("u", &[], 3, 5_000).await.expect("bump");
        assert_eq!(wh.table_versions().await.expect("versions")["u"], 3);
        assert!(!wh.table_exists("u").await.expect("exists"));
        // Once history exists, the precondition is strict again.
        let err = wh
            .apply_operations("u", &[], 5, 5_000)
            .await
            .expect_err("version gap");
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn copies_record_and_complete() {
        let wh = MemoryWarehouse::new();
        wh.seed_table("t", 0);
        wh.manifest_copy("t", "mem://manifests/abc")
            .await
            .expect("copy");
        assert_eq!(
            wh.copies(),
            vec![CopyRecord {
                table: "t".to_string(),
                manifest_url: "mem://manifests/abc".to_string()
            }]
        );
        assert_eq!(
            wh.check_load_status("mem://manifests/abc")
                .await
                .expect("status"),
            LoadStatus::Complete
        );
    }

    #[tokio::test]
    async fn scripted_copy_failures() {
        let wh = MemoryWarehouse::new();
        wh.seed_table("t", 0);
        wh.fail_copies_matching("abc", true);
        let err = wh
            .manifest_copy("t", "mem://manifests/abc")
            .await
            .expect_err("scripted failure");
        assert!(err.is_retryable());
        wh.clear_copy_failures();
        wh.manifest_copy("t", "mem://manifests/abc")
            .await
            .expect("copy");
    }

    #[tokio::test]
    async fn unknown_manifest_is_not_found() {
        let wh = MemoryWarehouse::new();
        assert_eq!(
            wh.check_load_status("mem://manifests/ghost")
                .await
                .expect("status"),
            LoadStatus::NotFound
        );
    }
}
