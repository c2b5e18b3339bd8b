//! In-process cache of recently read records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use weave_common::Timestamp;
use weave_txn::DataItem;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct CachedItem {
    /// Snapshot the item was resolved for. A hit requires the same
    /// snapshot: repeated reads from one transaction share a start time,
    /// and two snapshots may legitimately see different versions.
    snapshot: Timestamp,
    item: DataItem,
}

/// Cache keyed by (datastore, key), scoped to one read snapshot per entry.
///
/// Purely an optimization: a hit returns exactly what the resolver would,
/// and the committer invalidates every key it touches.
#[derive(Default)]
pub struct ItemCache {
    items: RwLock<HashMap<(String, String), CachedItem>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ds_name: &str, key: &str, snapshot: Timestamp) -> Option<DataItem> {
        let items = self.items.read();
        match items.get(&(ds_name.to_string(), key.to_string())) {
            Some(cached) if cached.snapshot == snapshot => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached.item.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, ds_name: &str, key: &str, snapshot: Timestamp, item: DataItem) {
        self.items.write().insert(
            (ds_name.to_string(), key.to_string()),
            CachedItem { snapshot, item },
        );
    }

    pub fn invalidate(&self, ds_name: &str, key: &str) {
        self.items
            .write()
            .remove(&(ds_name.to_string(), key.to_string()));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
