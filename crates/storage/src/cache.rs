//! A bounded, soft-reference-style cache of materialized record views
//! (spec §4.2 "a soft-reference cache holds recently materialized
//! records"). A plain LRU cache stands in for JVM-style soft references:
//! entries are evicted by recency under a size budget rather than by the
//! garbage collector, but the contract seen by callers is identical —
//! a miss just re-materializes from the blocks.

use concourse_core::RecordView;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Entry {
    value: Arc<RecordView>,
    last_used: u64,
}

/// An LRU-evicted cache of `(key, record) -> RecordView` materializations.
pub struct RecordCache {
    capacity: usize,
    entries: Mutex<HashMap<(String, u64), Entry>>,
    clock: std::sync::atomic::AtomicU64,
}

impl RecordCache {
    /// A cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        RecordCache {
            capacity,
            entries: Mutex::new(HashMap::new()),
            clock: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Look up a cached materialization, bumping its recency on hit.
    pub fn get(&self, locator: &str, record: u64) -> Option<Arc<RecordView>> {
        let mut entries = self.entries.lock();
        let now = self.tick();
        let key = (locator.to_string(), record);
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = now;
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Insert (or refresh) a materialization, evicting the least-recently
    /// used entry if the cache is at capacity.
    pub fn put(&self, locator: &str, record: u64, value: RecordView) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        let now = self.tick();
        let key = (locator.to_string(), record);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }
        entries.insert(
            key,
            Entry {
                value: Arc::new(value),
                last_used: now,
            },
        );
    }

    /// Drop every cached entry (called when the underlying blocks change
    /// shape, e.g. a `Database::sync` seal).
    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use concourse_core::Value;

    fn view() -> RecordView {
        let mut m = RecordView::new();
        m.insert("name".into(), BTreeSet::from([Value::String("jeff".into())]));
        m
    }

    #[test]
    fn hit_after_put() {
        let cache = RecordCache::new(2);
        cache.put("select", 1, view());
        assert!(cache.get("select", 1).is_some());
        assert!(cache.get("select", 2).is_none());
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = RecordCache::new(1);
        cache.put("select", 1, view());
        cache.put("select", 2, view());
        assert!(cache.get("select", 1).is_none());
        assert!(cache.get("select", 2).is_some());
    }

    #[test]
    fn invalidate_all_clears_cache() {
        let cache = RecordCache::new(4);
        cache.put("select", 1, view());
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
