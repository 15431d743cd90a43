//! The load-status contract between the metadata store and the warehouse.
//!
//! After a crash, manifests stuck in `Loading` are reconciled by asking the
//! warehouse what actually happened to the COPY. The metadata store only
//! needs this one capability from the warehouse, so it is expressed as a
//! narrow trait here rather than a dependency on the whole adapter.

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a warehouse-side probe for a previously submitted COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The COPY is still visible as running.
    InProgress,
    /// The COPY's transaction committed.
    Complete,
    /// The COPY's transaction aborted or was rolled back.
    Failed,
    /// No trace of the COPY exists in the warehouse's query history.
    NotFound,
}

impl LoadStatus {
    /// Stable lowercase name, used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
        }
    }
}

/// Capability to probe the warehouse for the outcome of a manifest COPY.
#[async_trait]
pub trait LoadChecker: Send + Sync {
    /// Inspects the warehouse's transaction logs for the COPY that
    /// referenced `manifest_url` and reports its outcome.
    async fn check_load_status(&self, manifest_url: &str) -> Result<LoadStatus>;
}
