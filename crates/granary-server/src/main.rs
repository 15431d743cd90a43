//! # granary-ingesterd
//!
//! The loader process: initializes the version cache from the warehouse,
//! recovers in-flight loads, then runs the dispenser, the worker pool, the
//! migrator, and the localhost control surface until SIGINT.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use granary_core::{backend_from_location, init_logging, LogFormat, VersionCache};
use granary_metadata::{
    spawn_dispenser, AssemblyConfig, DispenserConfig, LoaderContext, ManifestUploader,
    MetadataBackend, PgMetadataStore,
};
use granary_registry::{HttpRegistryClient, RegistryClient};
use granary_server::control::{control_router, ControlState};
use granary_server::migrator::{Migrator, MigratorConfig};
use granary_server::{metrics, spawn_workers};
use granary_warehouse::{CredentialsProvider, EnvCredentials, RedshiftWarehouse, Warehouse};

/// Warehouse loader.
#[derive(Debug, Parser)]
#[command(name = "granary-ingesterd")]
#[command(about = "Batches queued fragments into warehouse loads and migrates table schemas")]
#[command(version)]
struct Args {
    /// Postgres-scheme URL for the metadata database.
    #[arg(long, env = "GRANARY_DATABASE_URL")]
    database_url: String,

    /// Max metadata database connections.
    #[arg(long, env = "GRANARY_MAX_DB_CONNECTIONS", default_value = "5")]
    max_db_connections: u32,

    /// Postgres-protocol URL for the warehouse.
    #[arg(long, env = "GRANARY_WAREHOUSE_URL")]
    warehouse_url: String,

    /// Storage location for manifest documents
    /// (`mem://…`, `file://…`, or a directory path).
    #[arg(long, env = "GRANARY_MANIFEST_BUCKET")]
    manifest_bucket: String,

    /// Number of load workers (and warehouse connections). 0 disables
    /// loads; the migrator and control surface still run.
    #[arg(long = "n-workers", env = "GRANARY_N_WORKERS", default_value = "5")]
    n_workers: usize,

    /// Queued fragments per table that trigger a load.
    #[arg(long, env = "GRANARY_LOAD_COUNT_TRIGGER", default_value = "5")]
    load_count_trigger: usize,

    /// Max age in seconds of a queued fragment before a load triggers.
    #[arg(long, env = "GRANARY_LOAD_AGE_SECONDS", default_value = "1800")]
    load_age_seconds: u64,

    /// Upper bound on fragments per manifest.
    #[arg(long, env = "GRANARY_MAX_MANIFEST_FRAGMENTS", default_value = "500")]
    max_manifest_fragments: usize,

    /// Seconds between dispenser passes over the queue.
    #[arg(long, env = "GRANARY_LOAD_POLL_SECS", default_value = "10")]
    load_poll_secs: u64,

    /// Seconds between migrator reconciliation passes.
    #[arg(long, env = "GRANARY_MIGRATOR_POLL_SECS", default_value = "60")]
    migrator_poll_secs: u64,

    /// Quiescence wait in seconds before a migration may start.
    #[arg(long, env = "GRANARY_WAIT_PROCESSOR_SECS", default_value = "180")]
    wait_processor_secs: u64,

    /// UTC hour the off-peak migration window opens.
    #[arg(long, env = "GRANARY_OFFPEAK_START_HOUR", default_value = "3")]
    offpeak_start_hour: u32,

    /// Length of the off-peak window in hours.
    #[arg(long, env = "GRANARY_OFFPEAK_DURATION_HOURS", default_value = "8")]
    offpeak_duration_hours: u32,

    /// Statement timeout for forced on-peak migrations, in milliseconds.
    #[arg(long, env = "GRANARY_ONPEAK_TIMEOUT_MS", default_value = "300000")]
    onpeak_migration_timeout_ms: i64,

    /// Statement timeout for off-peak migrations, in milliseconds.
    #[arg(long, env = "GRANARY_OFFPEAK_TIMEOUT_MS", default_value = "1800000")]
    offpeak_migration_timeout_ms: i64,

    /// Schema registry host (optionally with scheme and port).
    #[arg(long, env = "GRANARY_REGISTRY_HOST")]
    registry_host: String,

    /// Port for the localhost control surface and health endpoints.
    #[arg(long, env = "GRANARY_CONTROL_PORT", default_value = "8080")]
    control_port: u16,

    /// Emit JSON logs instead of pretty ones.
    #[arg(long, env = "GRANARY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });
    metrics::init_metrics();
    tracing::info!("starting granary-ingesterd");

    let credentials: Arc<dyn CredentialsProvider> = Arc::new(EnvCredentials);
    let warehouse = Arc::new(
        RedshiftWarehouse::connect(&args.warehouse_url, args.n_workers as u32, credentials)
            .await
            .context("connecting to the warehouse")?,
    );

    let versions = Arc::new(VersionCache::new(
        warehouse
            .table_versions()
            .await
            .context("initializing the table version cache")?,
    ));

    let manifest_storage =
        backend_from_location(&args.manifest_bucket).context("opening the manifest bucket")?;
    let store = Arc::new(
        PgMetadataStore::connect(
            &args.database_url,
            args.max_db_connections,
            Some(LoaderContext {
                uploader: ManifestUploader::new(manifest_storage, "manifests"),
                versions: Arc::clone(&versions),
            }),
        )
        .await
        .context("connecting to the metadata database")?,
    );

    // Reconcile loads that were in flight when the previous process died.
    store
        .recover_in_flight(&*warehouse)
        .await
        .context("recovering in-flight loads")?;

    let registry: Arc<dyn RegistryClient> = Arc::new(
        HttpRegistryClient::new(&args.registry_host).context("building the registry client")?,
    );

    let shutdown = CancellationToken::new();
    let migrator_shutdown = shutdown.child_token();
    let dispenser_shutdown = shutdown.child_token();

    let mut worker_handles = Vec::new();
    let mut dispenser_handle = None;
    if args.n_workers > 0 {
        let (ready, handle) = spawn_dispenser(
            Arc::clone(&store) as Arc<dyn MetadataBackend>,
            DispenserConfig {
                assembly: AssemblyConfig {
                    count_trigger: args.load_count_trigger,
                    age_trigger: Duration::from_secs(args.load_age_seconds),
                    max_fragments: args.max_manifest_fragments,
                },
                poll_period: Duration::from_secs(args.load_poll_secs),
                channel_capacity: args.n_workers * 2,
            },
            dispenser_shutdown.clone(),
        );
        dispenser_handle = Some(handle);
        worker_handles = spawn_workers(
            args.n_workers,
            ready,
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::clone(&store) as Arc<dyn MetadataBackend>,
        );
    } else {
        tracing::warn!("n-workers is 0; loads are disabled");
    }

    let (increment_tx, increment_rx) = mpsc::channel(4);
    let migrator = Migrator::new(
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&store) as Arc<dyn MetadataBackend>,
        registry,
        Arc::clone(&versions),
        MigratorConfig {
            poll_period: Duration::from_secs(args.migrator_poll_secs),
            wait_processor_period: Duration::from_secs(args.wait_processor_secs),
            offpeak_start_hour: args.offpeak_start_hour,
            offpeak_duration_hours: args.offpeak_duration_hours,
            onpeak_timeout_ms: args.onpeak_migration_timeout_ms,
            offpeak_timeout_ms: args.offpeak_migration_timeout_ms,
        },
    );
    let migrator_handle = migrator.spawn(increment_rx, migrator_shutdown.clone());

    let router = control_router(ControlState {
        store: Arc::clone(&store) as Arc<dyn MetadataBackend>,
        warehouse: Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        versions,
        increments: increment_tx,
    });
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, args.control_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control surface at {addr}"))?;
    tracing::info!(address = %addr, "serving control surface and health");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(%error, "control surface failed");
        }
    });

    tracing::info!("loader is set up");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("sigint received; shutting down");

    // Stop the migrator first (it finishes in-flight DDL), then close the
    // ready stream and let the workers drain.
    migrator_shutdown.cancel();
    let _ = migrator_handle.await;
    dispenser_shutdown.cancel();
    if let Some(handle) = dispenser_handle {
        let _ = handle.await;
    }
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("exiting cleanly");
    Ok(())
}
