//! Bounded LRU filter over recently-seen message IDs.
//!
//! Capacity and TTL bound the memory; false negatives (a replay slipping
//! through after eviction or expiry) are tolerable because fragment
//! insertion downstream is idempotent on the object URL.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Deduplication filter keyed by message ID.
pub struct DedupFilter {
    inner: Mutex<LruCache<String, Instant>>,
    ttl: Duration,
}

impl DedupFilter {
    /// Creates a filter remembering up to `capacity` IDs for `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Records a sighting of `id`. Returns `true` the first time an ID is
    /// seen within the TTL; `false` for replays.
    pub fn observe(&self, id: &str) -> bool {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seen_at) = cache.get(id) {
            if seen_at.elapsed() < self.ttl {
                return false;
            }
        }
        cache.put(id.to_string(), Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_within_ttl_are_dropped() {
        let filter = DedupFilter::new(1000, Duration::from_secs(3600));
        assert!(filter.observe("msg-1"));
        assert!(!filter.observe("msg-1"));
        assert!(filter.observe("msg-2"));
    }

    #[test]
    fn expired_entries_are_fresh_again() {
        let filter = DedupFilter::new(1000, Duration::ZERO);
        assert!(filter.observe("msg-1"));
        assert!(filter.observe("msg-1"));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let filter = DedupFilter::new(2, Duration::from_secs(3600));
        assert!(filter.observe("a"));
        assert!(filter.observe("b"));
        assert!(filter.observe("c"));
        // "a" was evicted, so a replay of it slips through.
        assert!(filter.observe("a"));
        // "c" is still remembered.
        assert!(!filter.observe("c"));
    }
}
