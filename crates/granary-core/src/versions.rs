//! In-memory mirror of each table's current warehouse schema version.
//!
//! Populated at startup from `infra.table_version` and mutated only by the
//! migrator. Everything else (control surface, migrator planning) reads
//! through this cache instead of hitting the warehouse.

use std::collections::HashMap;
use std::sync::RwLock;

/// Process-wide `(table -> current version)` cache.
///
/// Versions only ever increase; a [`VersionCache::set`] with a smaller
/// version than the one cached is ignored.
#[derive(Debug, Default)]
pub struct VersionCache {
    inner: RwLock<HashMap<String, i64>>,
}

impl VersionCache {
    /// Creates a cache seeded with the warehouse's current versions.
    #[must_use]
    pub fn new(initial: HashMap<String, i64>) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    /// The cached version for `table`, or `None` if the table is unknown
    /// (not yet created in the warehouse).
    #[must_use]
    pub fn get(&self, table: &str) -> Option<i64> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(table).copied())
    }

    /// Records a new version for `table`.
    ///
    /// Regressions are dropped: the version history is monotonic and a
    /// stale write must not mask a newer one.
    pub fn set(&self, table: &str, version: i64) {
        let Ok(mut map) = self.inner.write() else {
            return;
        };
        match map.get(table) {
            Some(&current) if current >= version => {
                tracing::warn!(
                    table,
                    current,
                    version,
                    "ignoring version cache regression"
                );
            }
            _ => {
                map.insert(table.to_string(), version);
            }
        }
    }

    /// A copy of the full cache contents.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.inner.read().map(|map| map.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_seeded_versions() {
        let cache = VersionCache::new(HashMap::from([("minute_watched".to_string(), 4)]));
        assert_eq!(cache.get("minute_watched"), Some(4));
        assert_eq!(cache.get("unknown"), None);
    }

    #[test]
    fn set_advances_version() {
        let cache = VersionCache::default();
        cache.set("chat_message", 0);
        cache.set("chat_message", 1);
        assert_eq!(cache.get("chat_message"), Some(1));
    }

    #[test]
    fn set_ignores_regressions() {
        let cache = VersionCache::new(HashMap::from([("chat_message".to_string(), 5)]));
        cache.set("chat_message", 3);
        assert_eq!(cache.get("chat_message"), Some(5));
    }

    #[test]
    fn snapshot_copies_state() {
        let cache = VersionCache::default();
        cache.set("a", 1);
        let snap = cache.snapshot();
        cache.set("a", 2);
        assert_eq!(snap.get("a"), Some(&1));
    }
}
