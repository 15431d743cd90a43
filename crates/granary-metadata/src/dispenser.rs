//! The dispenser task behind `LoadReady`.
//!
//! One dispenser polls the store and feeds every leased manifest into a
//! channel shared by the worker pool. A single assembler means at-most-once
//! leasing inside the process; `FOR UPDATE SKIP LOCKED` covers other
//! processes. When the dispenser's cancellation token fires, the channel
//! closes and workers drain out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::Manifest;
use crate::{AssemblyConfig, MetadataBackend};

/// Dispenser tuning.
#[derive(Debug, Clone)]
pub struct DispenserConfig {
    /// Trigger rule for manifest assembly.
    pub assembly: AssemblyConfig,
    /// How often to look for ready work.
    pub poll_period: Duration,
    /// Bound on manifests buffered ahead of the workers.
    pub channel_capacity: usize,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            assembly: AssemblyConfig::default(),
            poll_period: Duration::from_secs(10),
            channel_capacity: 16,
        }
    }
}

/// Shared consumer handle for the ready-manifest stream.
///
/// Clones hand the same underlying sequence to N workers; each manifest is
/// received exactly once.
#[derive(Clone)]
pub struct LoadReady {
    inner: Arc<tokio::sync::Mutex<mpsc::Receiver<Manifest>>>,
}

impl LoadReady {
    /// Receives the next ready manifest, or `None` once the dispenser has
    /// shut down and the channel drained.
    pub async fn recv(&self) -> Option<Manifest> {
        self.inner.lock().await.recv().await
    }

    /// Builds a `LoadReady` from a raw receiver. Test helper.
    #[must_use]
    pub fn from_receiver(receiver: mpsc::Receiver<Manifest>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

/// Spawns the dispenser loop.
///
/// Returns the shared stream and the task handle to await during shutdown.
pub fn spawn_dispenser(
    backend: Arc<dyn MetadataBackend>,
    cfg: DispenserConfig,
    shutdown: CancellationToken,
) -> (LoadReady, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.poll_period);
        tracing::info!("load dispenser started");
        'outer: loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let leased = match backend.lease_ready(&cfg.assembly).await {
                Ok(leased) => leased,
                Err(error) => {
                    // Transient store trouble becomes a skipped tick.
                    tracing::warn!(%error, "lease pass failed; skipping tick");
                    continue;
                }
            };

            for manifest in leased {
                tokio::select! {
                    () = shutdown.cancelled() => break 'outer,
                    sent = tx.send(manifest) => {
                        if sent.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        }
        tracing::info!("load dispenser stopped");
    });
    (LoadReady::from_receiver(rx), handle)
}
