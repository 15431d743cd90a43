//! Postgres-backed metadata store.
//!
//! Manifest assembly and lease acquisition run inside single transactions
//! with `FOR UPDATE SKIP LOCKED`, so concurrent store instances never hand
//! the same fragment or manifest to two workers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use granary_core::{Error, LoadChecker, LoadStatus, Result};

use crate::models::{Fragment, Manifest, ManifestState};
use crate::{AssemblyConfig, LoaderContext, MetadataBackend};

/// Queue schema, applied idempotently at connect time.
const SCHEMA: &str = include_str!("schema.sql");

/// Metadata store over a Postgres pool.
///
/// The storer process connects without a [`LoaderContext`] (it only
/// inserts fragments); the loader process supplies one so `lease_ready`
/// can assemble and publish manifests.
pub struct PgMetadataStore {
    pool: PgPool,
    loader: Option<LoaderContext>,
}

impl PgMetadataStore {
    /// Connects, applies the schema, and returns the store.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        loader: Option<LoaderContext>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::metadata("connecting to metadata store", &e))?;

        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() || statement.lines().all(|l| l.trim().starts_with("--")) {
                continue;
            }
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| Error::metadata("applying metadata schema", &e))?;
        }

        Ok(Self { pool, loader })
    }

    fn loader(&self) -> Result<&LoaderContext> {
        self.loader.as_ref().ok_or_else(|| {
            Error::internal("this metadata store was opened without a loader context")
        })
    }

    /// Moves every `pending` manifest back to `loading` and returns them,
    /// oldest first.
    async fn release_pending(&self) -> Result<Vec<Manifest>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::metadata("beginning re-lease transaction", &e))?;

        let uuids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT uuid FROM manifest WHERE state = $1
             ORDER BY created_at FOR UPDATE SKIP LOCKED",
        )
        .bind(ManifestState::Pending.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::metadata("selecting pending manifests", &e))?;

        if uuids.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| Error::metadata("rolling back empty re-lease", &e))?;
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE manifest SET state = $1 WHERE uuid = ANY($2)")
            .bind(ManifestState::Loading.as_str())
            .bind(&uuids)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::metadata("re-leasing pending manifests", &e))?;

        let rows: Vec<(Uuid, String, String, i32, Option<String>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT uuid, table_name, manifest_url, attempts, last_error, created_at
                 FROM manifest WHERE uuid = ANY($1) ORDER BY created_at",
            )
            .bind(&uuids)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Error::metadata("reading re-leased manifests", &e))?;

        let mut manifests = Vec::with_capacity(rows.len());
        for (uuid, table_name, manifest_url, attempts, last_error, created_at) in rows {
            let urls: Vec<String> = sqlx::query_scalar(
                "SELECT url FROM manifest_tsv WHERE manifest_uuid = $1 ORDER BY url",
            )
            .bind(uuid)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Error::metadata("reading manifest membership", &e))?;
            manifests.push(Manifest {
                uuid,
                table_name,
                urls,
                manifest_url,
                attempts,
                last_error,
                created_at,
            });
        }

        tx.commit()
            .await
            .map_err(|e| Error::metadata("committing re-lease transaction", &e))?;
        Ok(manifests)
    }

    /// Tables whose unassigned fragments at their current warehouse
    /// version meet a trigger.
    ///
    /// Fragments at other versions never become candidates here: newer
    /// ones wait for the migrator, older stragglers are held.
    async fn assembly_candidates(&self, cfg: &AssemblyConfig) -> Result<Vec<(String, i64)>> {
        let versions = self.loader()?.versions.snapshot();

        let rows: Vec<(String, i64, i64, DateTime<Utc>, bool)> = sqlx::query_as(
            "SELECT t.table_name, t.version, COUNT(*), MIN(t.received_at),
                    EXISTS (SELECT 1 FROM force_load f
                            WHERE f.table_name = t.table_name)
             FROM tsv t
             WHERE NOT EXISTS (
                 SELECT 1 FROM manifest_tsv mt WHERE mt.url = t.url)
             GROUP BY t.table_name, t.version
             ORDER BY t.table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::metadata("finding assembly candidates", &e))?;

        let age_cutoff = Utc::now()
            - chrono::Duration::from_std(cfg.age_trigger)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800));

        Ok(rows
            .into_iter()
            .filter(|(table, version, pending, oldest, forced)| {
                versions.get(table) == Some(version)
                    && (*forced
                        || *pending >= cfg.count_trigger as i64
                        || *oldest <= age_cutoff)
            })
            .map(|(table, version, _, _, _)| (table, version))
            .collect())
    }

    /// Assembles one manifest for `(table, version)` in a single
    /// transaction, uploading the document before commit.
    async fn assemble(
        &self,
        table: &str,
        version: i64,
        cfg: &AssemblyConfig,
    ) -> Result<Option<Manifest>> {
        let uploader = self.loader()?.uploader.clone();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::metadata("beginning assembly transaction", &e))?;

        let urls: Vec<String> = sqlx::query_scalar(
            "SELECT url FROM tsv t
             WHERE t.table_name = $1 AND t.version = $2
               AND NOT EXISTS (
                   SELECT 1 FROM manifest_tsv mt WHERE mt.url = t.url)
             ORDER BY t.received_at
             LIMIT $3
             FOR UPDATE SKIP LOCKED",
        )
        .bind(table)
        .bind(version)
        .bind(cfg.max_fragments as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::metadata("locking fragments for assembly", &e))?;

        if urls.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| Error::metadata("rolling back empty assembly", &e))?;
            return Ok(None);
        }

        let uuid = Uuid::new_v4();
        let manifest_url = uploader.upload(uuid, &urls).await?;
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO manifest
                 (uuid, table_name, state, attempts, last_error, manifest_url, created_at)
             VALUES ($1, $2, $3, 0, NULL, $4, $5)",
        )
        .bind(uuid)
        .bind(table)
        .bind(ManifestState::Loading.as_str())
        .bind(&manifest_url)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::metadata("inserting manifest", &e))?;

        sqlx::query(
            "INSERT INTO manifest_tsv (manifest_uuid, url)
             SELECT $1, unnest($2::text[])",
        )
        .bind(uuid)
        .bind(&urls)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::metadata("inserting manifest membership", &e))?;

        sqlx::query("DELETE FROM force_load WHERE table_name = $1")
            .bind(table)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::metadata("clearing force-load request", &e))?;

        tx.commit()
            .await
            .map_err(|e| Error::metadata("committing assembly transaction", &e))?;

        Ok(Some(Manifest {
            uuid,
            table_name: table.to_string(),
            urls,
            manifest_url,
            attempts: 0,
            last_error: None,
            created_at,
        }))
    }
}

#[async_trait]
impl MetadataBackend for PgMetadataStore {
    async fn insert_load(&self, fragment: Fragment) -> Result<()> {
        sqlx::query(
            "INSERT INTO tsv (table_name, url, version, received_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (url) DO NOTHING",
        )
        .bind(&fragment.table_name)
        .bind(&fragment.url)
        .bind(fragment.version)
        .bind(fragment.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::metadata("inserting fragment", &e))?;
        Ok(())
    }

    async fn lease_ready(&self, cfg: &AssemblyConfig) -> Result<Vec<Manifest>> {
        let mut leased = self.release_pending().await?;
        for (table, version) in self.assembly_candidates(cfg).await? {
            if let Some(manifest) = self.assemble(&table, version, cfg).await? {
                leased.push(manifest);
            }
        }
        Ok(leased)
    }

    async fn load_done(&self, uuid: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::metadata("beginning load-done transaction", &e))?;
        sqlx::query(
            "DELETE FROM tsv WHERE url IN
                 (SELECT url FROM manifest_tsv WHERE manifest_uuid = $1)",
        )
        .bind(uuid)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::metadata("deleting loaded fragments", &e))?;
        sqlx::query("DELETE FROM manifest_tsv WHERE manifest_uuid = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::metadata("deleting manifest membership", &e))?;
        sqlx::query("DELETE FROM manifest WHERE uuid = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::metadata("deleting manifest", &e))?;
        tx.commit()
            .await
            .map_err(|e| Error::metadata("committing load-done transaction", &e))?;
        Ok(())
    }

    async fn load_error(&self, uuid: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE manifest
             SET state = $1, attempts = attempts + 1, last_error = $2
             WHERE uuid = $3",
        )
        .bind(ManifestState::Pending.as_str())
        .bind(reason)
        .bind(uuid)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::metadata("recording load error", &e))?;
        Ok(())
    }

    async fn tsv_version_exists(&self, table: &str, version: i64) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM tsv WHERE table_name = $1 AND version = $2)",
        )
        .bind(table)
        .bind(version)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::metadata("probing fragment versions", &e))
    }

    async fn force_load(&self, table: &str, requested_by: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO force_load (table_name, requested_by)
             VALUES ($1, $2)
             ON CONFLICT (table_name) DO NOTHING",
        )
        .bind(table)
        .bind(requested_by)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::metadata("recording force-load request", &e))?;
        Ok(())
    }

    async fn is_force_load_requested(&self, table: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM force_load WHERE table_name = $1)")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::metadata("probing force-load requests", &e))
    }

    async fn versions(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT table_name, MAX(version) FROM tsv GROUP BY table_name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::metadata("reading queued versions", &e))?;
        Ok(rows.into_iter().collect())
    }

    async fn list_distinct_tables(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT table_name FROM tsv ORDER BY table_name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::metadata("listing queued tables", &e))
    }

    async fn recover_in_flight(&self, checker: &dyn LoadChecker) -> Result<()> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            "SELECT uuid, table_name, manifest_url FROM manifest WHERE state = $1",
        )
        .bind(ManifestState::Loading.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::metadata("finding in-flight manifests", &e))?;

        for (uuid, table_name, manifest_url) in rows {
            let status = checker.check_load_status(&manifest_url).await?;
            tracing::info!(
                manifest_uuid = %uuid,
                table = %table_name,
                status = status.as_str(),
                "reconciling in-flight manifest"
            );
            match status {
                LoadStatus::Complete => self.load_done(uuid).await?,
                LoadStatus::Failed | LoadStatus::NotFound => {
                    sqlx::query("UPDATE manifest SET state = $1 WHERE uuid = $2")
                        .bind(ManifestState::Pending.as_str())
                        .bind(uuid)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| Error::metadata("resetting in-flight manifest", &e))?;
                }
                LoadStatus::InProgress => {}
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::metadata("pinging metadata store", &e))?;
        Ok(())
    }
}
