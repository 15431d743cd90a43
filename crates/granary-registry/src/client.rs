//! Schema-registry client: `get_migration(table, to_version) -> [Operation]`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use granary_core::{Error, Result};
use granary_warehouse::Operation;

/// Fetches the ordered DDL operations for a `(table, target_version)`.
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// The operations that migrate `table` to `to_version`.
    async fn get_migration(&self, table: &str, to_version: i64) -> Result<Vec<Operation>>;
}

/// HTTP client against the schema registry service.
pub struct HttpRegistryClient {
    base: String,
    client: reqwest::Client,
}

impl HttpRegistryClient {
    /// Creates a client for the registry at `host` (with or without an
    /// explicit scheme).
    pub fn new(host: &str) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::Config("schema registry host is not set".to_string()));
        }
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Registry(format!("building http client: {e}")))?;
        Ok(Self { base, client })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn get_migration(&self, table: &str, to_version: i64) -> Result<Vec<Operation>> {
        let url = format!("{}/migration/{table}", self.base);
        let response = self
            .client
            .get(&url)
            .query(&[("to_version", to_version)])
            .send()
            .await
            .map_err(|e| Error::Registry(format!("requesting migration for {table}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "registry returned {} for {table} v{to_version}",
                response.status()
            )));
        }

        response
            .json::<Vec<Operation>>()
            .await
            .map_err(|e| Error::Registry(format!("decoding migration for {table}: {e}")))
    }
}

/// Canned registry for tests: serves whatever was inserted.
#[derive(Default)]
pub struct StaticRegistry {
    migrations: Mutex<HashMap<(String, i64), Vec<Operation>>>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the migration for `(table, to_version)`.
    pub fn insert(&self, table: &str, to_version: i64, ops: Vec<Operation>) {
        self.migrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((table.to_string(), to_version), ops);
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn get_migration(&self, table: &str, to_version: i64) -> Result<Vec<Operation>> {
        self.migrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(table.to_string(), to_version))
            .cloned()
            .ok_or_else(|| {
                Error::Registry(format!("no migration registered for {table} v{to_version}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_normalizes_host() {
        let client = HttpRegistryClient::new("registry.internal:8888").expect("client");
        assert_eq!(client.base, "http://registry.internal:8888");
        let client = HttpRegistryClient::new("https://registry.internal/").expect("client");
        assert_eq!(client.base, "https://registry.internal");
        assert!(HttpRegistryClient::new("").is_err());
    }

    #[tokio::test]
    async fn static_registry_serves_inserted_migrations() {
        let registry = StaticRegistry::new();
        registry.insert("t", 1, vec![Operation::add("c", "int")]);

        let ops = registry.get_migration("t", 1).await.expect("ops");
        assert_eq!(ops.len(), 1);
        assert!(registry.get_migration("t", 2).await.is_err());
    }
}
