//! # granary-storer
//!
//! The ingress process: pulls fragment announcements from the message
//! queue and stores pointers into the metadata database. Runs alongside
//! `granary-ingesterd`, which drains the queue into the warehouse.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use granary_core::{backend_from_location, init_logging, LogFormat};
use granary_ingest::{
    metrics, DedupFilter, HmacVerifier, Ingress, ListenerConfig, PermissiveVerifier,
    RequestVerifier, SqsConfig, SqsQueue,
};
use granary_metadata::{MetadataBackend, PgMetadataStore};
use granary_registry::MetadataLoader;

/// Dedup filter bounds: 1000 recent message IDs, 1 hour TTL.
const DEDUP_CAPACITY: usize = 1000;
const DEDUP_TTL: Duration = Duration::from_secs(3600);

/// Attempts for the initial allow-list load before startup fails.
const ALLOWLIST_INITIAL_ATTEMPTS: u32 = 15;

/// Fragment announcement storer.
#[derive(Debug, Parser)]
#[command(name = "granary-storer")]
#[command(about = "Stores fragment announcements from the queue into the metadata database")]
#[command(version)]
struct Args {
    /// Postgres-scheme URL for the metadata database.
    #[arg(long, env = "GRANARY_DATABASE_URL")]
    database_url: String,

    /// Max metadata database connections.
    #[arg(long, env = "GRANARY_MAX_DB_CONNECTIONS", default_value = "5")]
    max_db_connections: u32,

    /// Queue URL to consume fragment announcements from.
    #[arg(long, env = "GRANARY_QUEUE_URL")]
    queue_url: String,

    /// Queue signing region.
    #[arg(long, env = "GRANARY_QUEUE_REGION", default_value = "us-west-2")]
    queue_region: String,

    /// Long-poll wait per queue receive, in seconds.
    #[arg(long, env = "GRANARY_QUEUE_POLL_WAIT_SECS", default_value = "30")]
    queue_poll_wait_secs: u64,

    /// Number of queue listeners to run.
    #[arg(long, env = "GRANARY_LISTENER_COUNT", default_value = "1")]
    listener_count: usize,

    /// Storage location holding the allow-list document
    /// (`mem://…`, `file://…`, or a directory path).
    #[arg(long, env = "GRANARY_ALLOWLIST_BUCKET")]
    allowlist_bucket: String,

    /// Object key of the allow-list document.
    #[arg(long, env = "GRANARY_ALLOWLIST_KEY")]
    allowlist_key: String,

    /// How often to refresh the allow-list, in seconds.
    #[arg(long, env = "GRANARY_ALLOWLIST_RELOAD_SECS", default_value = "300")]
    allowlist_reload_secs: u64,

    /// Backoff after a failed allow-list fetch, in milliseconds.
    #[arg(long, env = "GRANARY_ALLOWLIST_RETRY_DELAY_MS", default_value = "2000")]
    allowlist_retry_delay_ms: u64,

    /// Shared key for row-copy request signatures. Unsigned bodies are
    /// accepted when unset.
    #[arg(long, env = "GRANARY_SIGNING_KEY")]
    signing_key: Option<String>,

    /// Port for /metrics and /health.
    #[arg(long, env = "GRANARY_STORER_PORT", default_value = "7767")]
    port: u16,

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
    tracing::info!("starting granary-storer");

    let store: Arc<dyn MetadataBackend> = Arc::new(
        PgMetadataStore::connect(&args.database_url, args.max_db_connections, None)
            .await
            .context("connecting to the metadata database")?,
    );

    let config_storage = backend_from_location(&args.allowlist_bucket)
        .context("opening the allow-list bucket")?;
    let allowlist = MetadataLoader::load(
        config_storage,
        &args.allowlist_key,
        Duration::from_millis(args.allowlist_retry_delay_ms),
        ALLOWLIST_INITIAL_ATTEMPTS,
    )
    .await
    .context("initial allow-list load")?;

    let queue = Arc::new(
        SqsQueue::new(
            SqsConfig::from_env(&args.queue_url, &args.queue_region)
                .context("reading queue credentials")?,
        )
        .context("building queue consumer")?,
    );

    let verifier: Arc<dyn RequestVerifier> = match &args.signing_key {
        Some(key) => Arc::new(HmacVerifier::new(key.as_bytes().to_vec())),
        None => Arc::new(PermissiveVerifier),
    };

    let shutdown = CancellationToken::new();
    let refresh_handle = allowlist.spawn_refresh(
        Duration::from_secs(args.allowlist_reload_secs),
        shutdown.clone(),
    );

    let ingress = Ingress::new(
        queue,
        Arc::clone(&store),
        Arc::clone(&allowlist),
        verifier,
        DedupFilter::new(DEDUP_CAPACITY, DEDUP_TTL),
        ListenerConfig {
            poll_wait: Duration::from_secs(args.queue_poll_wait_secs),
            max_messages: 10,
        },
    )
    .await
    .context("building ingress")?;
    let listener_handles = ingress.spawn_listeners(args.listener_count, &shutdown);

    let health_store = Arc::clone(&store);
    let router = Router::new()
        .route("/metrics", get(metrics::serve_metrics))
        .route(
            "/health",
            get(move || {
                let store = Arc::clone(&health_store);
                async move {
                    match store.health_check().await {
                        Ok(()) => (axum::http::StatusCode::OK, "ok"),
                        Err(_) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
                    }
                }
            }),
        );
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let http = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(address = %addr, "serving metrics and health");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(http, router).await {
            tracing::error!(%error, "metrics server failed");
        }
    });

    tracing::info!("storer is set up");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("sigint received; shutting down");

    shutdown.cancel();
    for handle in listener_handles {
        let _ = handle.await;
    }
    let _ = refresh_handle.await;
    tracing::info!("exiting cleanly");
    Ok(())
}
