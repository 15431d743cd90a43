//! Process-local per-table lock registry.
//!
//! COPY and DDL for the same table must not interleave within this process;
//! the database transaction alone does not stop two of our own connections
//! from queueing conflicting work. Locks are async mutexes because they are
//! held across the full COPY or migration round-trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of `(table -> mutex)`, created on first use.
#[derive(Debug, Default)]
pub struct TableLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TableLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `table`, creating it if necessary. Callers hold the
    /// returned mutex for the duration of their COPY or DDL.
    #[must_use]
    pub fn for_table(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(table.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_table_yields_same_lock() {
        let locks = TableLocks::new();
        let a = locks.for_table("t");
        let b = locks.for_table("t");
        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn different_tables_do_not_contend() {
        let locks = TableLocks::new();
        let a = locks.for_table("a");
        let b = locks.for_table("b");
        let _ga = a.lock().await;
        assert!(b.try_lock().is_ok());
    }
}
