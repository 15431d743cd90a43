//! Queue data model: fragments, manifests, and the manifest document.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use granary_core::{Error, Result, StorageBackend};

/// One TSV file pointer awaiting ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Destination table.
    pub table_name: String,
    /// Object-storage URL of the gzipped TSV. Unique queue key.
    pub url: String,
    /// Schema version the fragment was produced against.
    pub version: i64,
    /// Arrival timestamp.
    pub received_at: DateTime<Utc>,
}

impl Fragment {
    /// Creates a fragment arriving now.
    #[must_use]
    pub fn new(table_name: impl Into<String>, url: impl Into<String>, version: i64) -> Self {
        Self {
            table_name: table_name.into(),
            url: url.into(),
            version,
            received_at: Utc::now(),
        }
    }
}

/// Load state of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestState {
    /// Assembled or reset after a failure; waiting for a lease.
    Pending,
    /// Leased by a worker (or in-flight at crash time).
    Loading,
    /// Loaded; rows are deleted so this state is never stored.
    Done,
    /// Terminal operator-attention state. Not stored: permanent failures
    /// stay in `Loading` for triage.
    Error,
}

impl ManifestState {
    /// Stable lowercase name used in the database and in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl FromStr for ManifestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "loading" => Ok(Self::Loading),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(Error::Serialization(format!(
                "unknown manifest state {other:?}"
            ))),
        }
    }
}

/// A group of fragments locked together for a single COPY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Manifest identity.
    pub uuid: Uuid,
    /// Table every member loads into.
    pub table_name: String,
    /// Member fragment URLs, in arrival order.
    pub urls: Vec<String>,
    /// Object-storage URL of the uploaded manifest document.
    pub manifest_url: String,
    /// How many times a load of this manifest has failed.
    pub attempts: i32,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
    /// Assembly time; manifests for a table are processed in this order.
    pub created_at: DateTime<Utc>,
}

/// Renders the manifest document consumed by the warehouse's bulk loader:
/// one `{"url": ..., "mandatory": true}` entry per line.
#[must_use]
pub fn manifest_document(urls: &[String]) -> String {
    let mut doc = String::new();
    for url in urls {
        doc.push_str(
            &serde_json::json!({ "url": url, "mandatory": true }).to_string(),
        );
        doc.push('\n');
    }
    doc
}

/// Uploads manifest documents and knows the URL they get.
#[derive(Clone)]
pub struct ManifestUploader {
    storage: Arc<dyn StorageBackend>,
    prefix: String,
}

impl ManifestUploader {
    /// Creates an uploader writing under `prefix/` in `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    fn key_for(&self, uuid: Uuid) -> String {
        if self.prefix.is_empty() {
            uuid.to_string()
        } else {
            format!("{}/{uuid}", self.prefix)
        }
    }

    /// Uploads the document for `uuid` and returns its URL.
    pub async fn upload(&self, uuid: Uuid, urls: &[String]) -> Result<String> {
        let key = self.key_for(uuid);
        self.storage
            .put(&key, Bytes::from(manifest_document(urls)))
            .await?;
        Ok(self.storage.url_for(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_core::MemoryBackend;

    #[test]
    fn manifest_document_is_newline_delimited_entries() {
        let doc = manifest_document(&[
            "s3://frags/a.tsv.gz".to_string(),
            "s3://frags/b.tsv.gz".to_string(),
        ]);
        let lines: Vec<&str> = doc.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"mandatory":true,"url":"s3://frags/a.tsv.gz"}"#
        );
    }

    #[test]
    fn state_roundtrip() {
        for state in [
            ManifestState::Pending,
            ManifestState::Loading,
            ManifestState::Done,
            ManifestState::Error,
        ] {
            assert_eq!(
                state.as_str().parse::<ManifestState>().expect("parse"),
                state
            );
        }
        assert!("bogus".parse::<ManifestState>().is_err());
    }

    #[tokio::test]
    async fn uploader_writes_under_prefix() {
        let backend = Arc::new(MemoryBackend::named("manifests"));
        let uploader = ManifestUploader::new(backend.clone(), "loads");
        let uuid = Uuid::new_v4();
        let url = uploader
            .upload(uuid, &["s3://frags/a.tsv.gz".to_string()])
            .await
            .expect("upload");
        assert_eq!(url, format!("mem://manifests/loads/{uuid}"));
        let stored = backend.get(&format!("loads/{uuid}")).await.expect("get");
        assert!(std::str::from_utf8(&stored)
            .expect("utf8")
            .contains("a.tsv.gz"));
    }
}
