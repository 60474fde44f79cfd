//! Provides the thread-safe, byte-budget aware store backing a cache namespace.
//!
//! A [ByteStore](ByteStore) wraps a [RecencyCache](crate::lru::RecencyCache) of
//! [ByteView](crate::cache::ByteView) values behind a mutex and tracks the byte
//! occupancy of all present entries. Note that even the read path takes the
//! exclusive lock: a lookup promotes the entry in the recency order and therefore
//! mutates the cache. Only [bytes](ByteStore::bytes) gets away without locking, as
//! the occupancy lives in an atomic which is maintained by the eviction callback.
//!
//! The store itself never decides *when* to evict for space - it only offers
//! [remove_oldest](ByteStore::remove_oldest). The namespace drives eviction after
//! each insertion until the occupancy is back under its budget.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::ByteView;
use crate::lru::RecencyCache;

/// A point-in-time snapshot of the counters of a [ByteStore](ByteStore).
pub struct StoreStats {
    /// The number of entries currently present.
    pub entries: usize,

    /// The byte occupancy, computed as the sum of key and value lengths over all
    /// present entries.
    pub bytes: i64,

    /// The total number of lookups.
    pub reads: u64,

    /// The number of lookups which found a value.
    pub hits: u64,

    /// The total number of insertions.
    pub writes: u64,
}

impl StoreStats {
    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

/// Provides a thread-safe map from string keys to immutable byte values which
/// keeps track of its total byte occupancy.
#[derive(Default)]
pub struct ByteStore {
    cache: Mutex<Option<RecencyCache<String, ByteView>>>,
    nbytes: Arc<AtomicI64>,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
}

impl ByteStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        ByteStore::default()
    }

    /// Stores the given view for the given key.
    ///
    /// The inner cache is initialized lazily on the first insertion, wiring an
    /// eviction callback which subtracts each leaving entry from the occupancy
    /// counter. As replacing a value reports the displaced entry to that callback
    /// as well, the counter stays exact for overwrites too.
    pub fn add(&self, key: String, value: ByteView) {
        let entry_size = (key.len() + value.len()) as i64;

        let mut guard = self.cache.lock().unwrap();
        let cache = guard.get_or_insert_with(|| {
            let nbytes = Arc::clone(&self.nbytes);
            RecencyCache::new(
                0,
                Some(Box::new(move |key: &String, value: &ByteView| {
                    let _ =
                        nbytes.fetch_sub((key.len() + value.len()) as i64, Ordering::Relaxed);
                })),
            )
        });

        cache.add(key, value);
        let _ = self.nbytes.fetch_add(entry_size, Ordering::Relaxed);
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the view stored for the given key.
    ///
    /// A hit promotes the entry to most recently used, hence this takes the
    /// exclusive lock like all other operations.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.cache.lock().unwrap();
        let result = guard.as_mut().and_then(|cache| cache.get(key).cloned());

        if result.is_some() {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Evicts the least recently used entry if any is present.
    pub fn remove_oldest(&self) {
        let mut guard = self.cache.lock().unwrap();
        if let Some(cache) = guard.as_mut() {
            cache.remove_oldest();
        }
    }

    /// Returns the current byte occupancy.
    pub fn bytes(&self) -> i64 {
        self.nbytes.load(Ordering::Relaxed)
    }

    /// Returns the number of entries currently present.
    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap()
            .as_ref()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }

    /// Determines if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the store counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len(),
            bytes: self.bytes(),
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ByteStore;
    use crate::cache::ByteView;

    #[test]
    fn occupancy_tracks_key_and_value_lengths() {
        let store = ByteStore::new();

        // Two entries of 6 bytes key data and 6 bytes value data each...
        store.add("Hello0".to_owned(), ByteView::from(b"World0".to_vec()));
        store.add("Hello1".to_owned(), ByteView::from(b"World1".to_vec()));
        assert_eq!(store.bytes(), 24);
        assert_eq!(store.len(), 2);

        // Replacing a value corrects the occupancy...
        store.add("Hello1".to_owned(), ByteView::from(b"!".to_vec()));
        assert_eq!(store.bytes(), 12 + 7);
        assert_eq!(store.len(), 2);

        // Evicting the oldest entry releases its bytes...
        store.remove_oldest();
        assert_eq!(store.bytes(), 7);
        assert_eq!(store.len(), 1);

        store.remove_oldest();
        assert_eq!(store.bytes(), 0);
        assert_eq!(store.is_empty(), true);

        // Draining an empty store is a no-op...
        store.remove_oldest();
        assert_eq!(store.bytes(), 0);
    }

    #[test]
    fn lookups_promote_entries() {
        let store = ByteStore::new();

        store.add("a".to_owned(), ByteView::from(b"1".to_vec()));
        store.add("b".to_owned(), ByteView::from(b"2".to_vec()));

        // Promote "a", then evict: "b" has to go first...
        assert_eq!(store.get("a").unwrap().as_slice(), b"1");
        store.remove_oldest();
        assert_eq!(store.get("b"), None);
        assert_eq!(store.get("a").unwrap().as_slice(), b"1");
    }

    #[test]
    fn counters_are_maintained() {
        let store = ByteStore::new();

        store.add("a".to_owned(), ByteView::from(b"1".to_vec()));
        let _ = store.get("a");
        let _ = store.get("a");
        let _ = store.get("miss");

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.hit_rate().round() as i32, 67);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 2);
    }

    #[test]
    fn lookups_on_an_uninitialized_store_miss() {
        let store = ByteStore::new();
        assert_eq!(store.get("anything"), None);
        assert_eq!(store.bytes(), 0);
    }
}
