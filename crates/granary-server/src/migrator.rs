//! The schema migrator.
//!
//! A single control loop reconciles the versions declared by queued
//! fragments against the warehouse's live versions. Table creation runs
//! unconditionally; upgrades wait out a quiescence window, drain the old
//! version's queue (injecting a force-load to hurry it), and respect the
//! off-peak window unless an operator force-load overrides it. The same
//! loop serves version-increment requests from the control surface, so
//! migrations and increments never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use granary_core::{Error, VersionCache};
use granary_metadata::MetadataBackend;
use granary_registry::RegistryClient;
use granary_warehouse::Warehouse;

use crate::metrics;

/// Failure modes of a version-increment request.
#[derive(Debug, thiserror::Error)]
pub enum IncrementError {
    /// The table already exists; increments are only for tables that were
    /// never created (drop/rename reconciliation).
    #[error("table {0} already exists; version increment is only for uncreated tables")]
    TableExists(String),
    /// The warehouse rejected the increment.
    #[error(transparent)]
    Warehouse(#[from] Error),
}

/// A request to bump a table's version without running DDL.
#[derive(Debug)]
pub struct VersionIncrement {
    /// Table to bump.
    pub table: String,
    /// Version to record.
    pub version: i64,
    /// Response slot.
    pub respond: oneshot::Sender<Result<(), IncrementError>>,
}

/// Migrator tuning.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Reconciliation period.
    pub poll_period: Duration,
    /// Quiescence window before an upgrade may start.
    pub wait_processor_period: Duration,
    /// UTC hour the off-peak window opens.
    pub offpeak_start_hour: u32,
    /// Length of the off-peak window in hours.
    pub offpeak_duration_hours: u32,
    /// Statement timeout for forced on-peak migrations.
    pub onpeak_timeout_ms: i64,
    /// Statement timeout for off-peak migrations.
    pub offpeak_timeout_ms: i64,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(60),
            wait_processor_period: Duration::from_secs(180),
            offpeak_start_hour: 3,
            offpeak_duration_hours: 8,
            onpeak_timeout_ms: 5 * 60 * 1000,
            offpeak_timeout_ms: 30 * 60 * 1000,
        }
    }
}

/// Whether `hour` falls inside `[start, start + duration)` modulo 24.
#[must_use]
pub fn is_off_peak(hour: u32, start: u32, duration: u32) -> bool {
    if duration == 0 {
        return false;
    }
    if duration >= 24 {
        return true;
    }
    let end = (start + duration) % 24;
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// The migrator loop state.
pub struct Migrator {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn MetadataBackend>,
    registry: Arc<dyn RegistryClient>,
    versions: Arc<VersionCache>,
    config: MigratorConfig,
    /// Quiescence bookkeeping: when an upgrade was first observed pending.
    migration_started: HashMap<(String, i64), Instant>,
}

impl Migrator {
    /// Creates a migrator.
    #[must_use]
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn MetadataBackend>,
        registry: Arc<dyn RegistryClient>,
        versions: Arc<VersionCache>,
        config: MigratorConfig,
    ) -> Self {
        Self {
            warehouse,
            store,
            registry,
            versions,
            config,
            migration_started: HashMap::new(),
        }
    }

    /// Spawns the control loop; it exits on cancellation after finishing
    /// any in-flight work.
    pub fn spawn(
        mut self,
        mut increments: mpsc::Receiver<VersionIncrement>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("migrator started");
            let mut ticker = tokio::time::interval(self.config.poll_period);
            // The first tick fires immediately; skip it so startup does not
            // race the version cache warmup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    request = increments.recv() => {
                        match request {
                            Some(request) => self.handle_increment(request).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => self.find_and_apply_migrations().await,
                }
            }
            tracing::info!("migrator stopped");
        })
    }

    /// Tables whose queued fragments declare a newer version than the
    /// warehouse has (or that the warehouse has never seen).
    async fn find_tables_to_migrate(&self) -> Result<Vec<String>, Error> {
        let queued = self.store.versions().await?;
        let mut tables: Vec<String> = queued
            .into_iter()
            .filter(|(table, queued_version)| match self.versions.get(table) {
                Some(current) => *queued_version > current,
                None => true,
            })
            .map(|(table, _)| table)
            .collect();
        tables.sort();
        Ok(tables)
    }

    /// One reconciliation pass.
    pub async fn find_and_apply_migrations(&mut self) {
        let outdated = match self.find_tables_to_migrate().await {
            Ok(outdated) => outdated,
            Err(error) => {
                tracing::error!(%error, "error finding migrations to apply");
                return;
            }
        };
        if outdated.is_empty() {
            tracing::debug!("no tables to migrate");
            return;
        }
        tracing::info!(num_tables = outdated.len(), "found tables to migrate");

        for table in outdated {
            let new_version = match self.versions.get(&table) {
                Some(current) => current + 1,
                // Table doesn't exist yet: create it by migrating to 0.
                None => 0,
            };

            // Creation runs no matter what; upgrades need off-peak or an
            // operator force-load, and a forced upgrade must not fight a
            // warehouse-side lock.
            let mut forced = false;
            if new_version > 0 && !self.is_off_peak_now() {
                forced = match self.store.is_force_load_requested(&table).await {
                    Ok(forced) => forced,
                    Err(error) => {
                        tracing::error!(%error, table, "error checking for pending force load");
                        continue;
                    }
                };
                if !forced {
                    tracing::info!(
                        table,
                        version = new_version,
                        offpeak_start_hour = self.config.offpeak_start_hour,
                        "not migrating; waiting for the off-peak window"
                    );
                    continue;
                }
                match self.warehouse.table_locked(&table).await {
                    Ok(false) => {}
                    Ok(true) => {
                        tracing::info!(
                            table,
                            version = new_version,
                            "not migrating; on-peak and the table is locked"
                        );
                        continue;
                    }
                    Err(error) => {
                        tracing::error!(%error, table, "error checking for table lock");
                        continue;
                    }
                }
            }

            if let Err(error) = self.migrate(&table, new_version, forced).await {
                metrics::record_migration(&table, "error");
                tracing::error!(%error, table, version = new_version, "error migrating table");
            }
        }
    }

    /// Checks whether fragments at the pre-migration version have drained;
    /// if not, injects a force-load so the workers prioritize them.
    async fn is_old_version_cleared(&self, table: &str, version: i64) -> Result<bool, Error> {
        if !self.store.tsv_version_exists(table, version).await? {
            return Ok(true);
        }
        self.store.force_load(table, "migrator").await?;
        Ok(false)
    }

    /// Migrates `table` to version `to`, honoring the quiescence window.
    pub async fn migrate(&mut self, table: &str, to: i64, forced: bool) -> Result<(), Error> {
        let ops = self.registry.get_migration(table, to).await?;

        if !self.warehouse.table_exists(table).await? {
            self.warehouse.create_table(table, &ops, to).await?;
        } else {
            // First observation starts the quiescence clock; the upgrade
            // waits for upstream producers of the old version to drain.
            let key = (table.to_string(), to);
            let Some(&started) = self.migration_started.get(&key) else {
                self.migration_started.insert(key, Instant::now());
                tracing::info!(
                    table,
                    version = to,
                    wait_secs = self.config.wait_processor_period.as_secs(),
                    "starting quiescence wait before migrating"
                );
                return Ok(());
            };
            if started.elapsed() < self.config.wait_processor_period {
                tracing::info!(table, version = to, "still in quiescence wait");
                return Ok(());
            }

            if !self.is_old_version_cleared(table, to - 1).await? {
                tracing::info!(table, version = to, "waiting for the old version to clear");
                return Ok(());
            }

            tracing::info!(table, version = to, forced, "beginning migration");
            let timeout_ms = if forced {
                self.config.onpeak_timeout_ms
            } else {
                self.config.offpeak_timeout_ms
            };
            self.warehouse
                .apply_operations(table, &ops, to, timeout_ms)
                .await?;
            self.migration_started.remove(&(table.to_string(), to));
        }

        self.versions.set(table, to);
        metrics::record_migration(table, "applied");
        tracing::info!(table, version = to, "migrated table successfully");
        Ok(())
    }

    /// Serves a version-increment request inline with the migration loop.
    pub async fn handle_increment(&self, request: VersionIncrement) {
        let VersionIncrement {
            table,
            version,
            respond,
        } = request;

        let result = match self.warehouse.table_exists(&table).await {
            Err(error) => Err(IncrementError::Warehouse(error)),
            Ok(true) => Err(IncrementError::TableExists(table.clone())),
            Ok(false) => self
                .warehouse
                .apply_operations(&table, &[], version, self.config.offpeak_timeout_ms)
                .await
                .map_err(IncrementError::Warehouse)
                .map(|()| {
                    self.versions.set(&table, version);
                    tracing::info!(table, version, "incremented table version");
                }),
        };
        let _ = respond.send(result);
    }

    fn is_off_peak_now(&self) -> bool {
        is_off_peak(
            chrono::Utc::now().hour(),
            self.config.offpeak_start_hour,
            self.config.offpeak_duration_hours,
        )
    }
}
