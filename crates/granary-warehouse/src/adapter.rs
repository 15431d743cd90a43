//! The production warehouse adapter, backed by a Postgres-protocol pool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use granary_core::{Error, LoadChecker, LoadStatus, Result};

use crate::copy::{manifest_copy_sql, CachedCredentials, CredentialsProvider};
use crate::ddl::{alter_table_sql, create_table_sql};
use crate::load_status;
use crate::locks::TableLocks;
use crate::ops::Operation;
use crate::Warehouse;

/// One extra connection beyond the worker pool, reserved for health checks.
const HEALTH_CHECK_POOL_SIZE: u32 = 1;

/// Warehouse adapter over a Postgres-protocol connection pool.
///
/// Holds the per-table lock registry; every COPY and every DDL statement for
/// a table serializes through its mutex in addition to the database-side
/// transaction.
pub struct RedshiftWarehouse {
    pool: PgPool,
    credentials: CachedCredentials<Arc<dyn CredentialsProvider>>,
    locks: TableLocks,
}

impl RedshiftWarehouse {
    /// Connects to the warehouse with `workers + 1` pooled connections and
    /// verifies reachability with a ping.
    pub async fn connect(
        url: &str,
        workers: u32,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(workers + HEALTH_CHECK_POOL_SIZE)
            .connect(url)
            .await
            .map_err(|e| Error::warehouse("connecting to warehouse", &e))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| Error::warehouse("pinging warehouse", &e))?;
        Ok(Self {
            pool,
            credentials: CachedCredentials::new(credentials),
            locks: TableLocks::new(),
        })
    }

    /// Asserts the version history for `table` currently reads `expected`.
    ///
    /// `expected == -1` means the table must not exist in the history yet.
    /// `allow_fresh` admits a table with no history at any target version;
    /// the op-less version increments used for drop/rename reconciliation
    /// jump straight to an arbitrary version.
    async fn expect_version(
        conn: &mut PgConnection,
        table: &str,
        expected: i64,
        allow_fresh: bool,
    ) -> Result<()> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM infra.table_version WHERE name = $1 GROUP BY name",
        )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::warehouse("reading table version", &e))?;

        match current {
            None if expected == -1 || allow_fresh => Ok(()),
            None => Err(Error::PreconditionFailed {
                message: format!(
                    "expected version {expected} for table {table}, but the table has no version history"
                ),
            }),
            Some(found) if found == expected => Ok(()),
            Some(found) => Err(Error::PreconditionFailed {
                message: format!(
                    "expected version {expected} for table {table}, found {found}"
                ),
            }),
        }
    }

    async fn insert_version_row(conn: &mut PgConnection, table: &str, version: i64) -> Result<()> {
        sqlx::query("INSERT INTO infra.table_version (name, version, ts) VALUES ($1, $2, GETDATE())")
            .bind(table)
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::warehouse("inserting table version row", &e))?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::warehouse("pinging warehouse", &e))?;
        Ok(())
    }

    async fn manifest_copy(&self, table: &str, manifest_url: &str) -> Result<()> {
        let lock = self.locks.for_table(table);
        let _guard = lock.lock().await;

        let credentials = self.credentials.current().await?;
        let sql = manifest_copy_sql(table, manifest_url, &credentials)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::warehouse("beginning copy transaction", &e))?;
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::warehouse(format!("copying manifest into {table}"), &e))?;
        tx.commit()
            .await
            .map_err(|e| Error::warehouse("committing copy transaction", &e))?;
        Ok(())
    }

    async fn table_versions(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, MAX(version) FROM infra.table_version GROUP BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Error::warehouse("reading table versions", &e))?;
        Ok(rows.into_iter().collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1
                FROM pg_catalog.pg_class
                JOIN pg_catalog.pg_namespace
                    ON pg_namespace.oid = pg_class.relnamespace
                WHERE pg_namespace.nspname = 'logs'
                    AND pg_class.relname = $1
                    AND pg_class.relkind = 'r'
            )",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::warehouse("querying whether table exists", &e))
    }

    async fn table_locked(&self, table: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1
                FROM pg_locks l JOIN pg_stat_all_tables t
                    ON l.relation = t.relid
                WHERE t.relname = $1
            )",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::warehouse(format!("querying whether {table} is locked"), &e))
    }

    async fn create_table(&self, table: &str, ops: &[Operation], version: i64) -> Result<()> {
        // DropEvent sentinel: the stream is being dropped, creation is a
        // no-op success.
        let Some(create_sql) = create_table_sql(table, ops)? else {
            return Ok(());
        };

        let lock = self.locks.for_table(table);
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::warehouse("beginning create transaction", &e))?;
        sqlx::query(&create_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::warehouse(format!("creating table {table}"), &e))?;
        Self::insert_version_row(&mut *tx, table, version).await?;
        tx.commit()
            .await
            .map_err(|e| Error::warehouse("committing create transaction", &e))?;
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::warehouse("beginning migration transaction", &e))?;

        Self::expect_version(&mut *tx, table, target_version - 1, ops.is_empty()).await?;

        // statement_timeout cannot be bound as a parameter; timeout_ms is a
        // trusted integer from configuration.
        sqlx::query(&format!("SET statement_timeout TO {timeout_ms}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::warehouse("setting migration timeout", &e))?;

        for op in ops {
            if let Some(alter_sql) = alter_table_sql(table, op)? {
                sqlx::query(&alter_sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Error::warehouse(format!("altering table {table}"), &e))?;
            }
        }

        Self::insert_version_row(&mut *tx, table, target_version).await?;
        tx.commit()
            .await
            .map_err(|e| Error::warehouse("committing migration transaction", &e))?;
        Ok(())
    }
}

#[async_trait]
impl LoadChecker for RedshiftWarehouse {
    async fn check_load_status(&self, manifest_url: &str) -> Result<LoadStatus> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::warehouse("beginning load-status transaction", &e))?;
        let status = load_status::check_load_status(&mut *tx, manifest_url).await?;
        tx.commit()
            .await
            .map_err(|e| Error::warehouse("committing load-status transaction", &e))?;
        Ok(status)
    }
}
