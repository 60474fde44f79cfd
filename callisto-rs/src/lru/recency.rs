//! Provides a generic cache which keeps its entries in recency order.
//!
//! A [RecencyCache](RecencyCache) behaves like a map, but remembers in which order
//! its entries were used. Reading or re-inserting an entry marks it as most
//! recently used; once the configured entry limit is exceeded, the least recently
//! used entry is dropped. An optional callback observes every entry which leaves
//! the cache, which is what the byte-budget store uses to keep its
//! occupancy counter exact.
//!
//! Note that this type performs no locking at all. Concurrent use is the concern
//! of its owner (see [ByteStore](crate::lru::store::ByteStore)).
use std::borrow::Borrow;
use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

/// Observes entries which leave the cache, no matter why (count eviction, explicit
/// removal or replacement by a newer value for the same key).
pub type EvictionCallback<K, V> = Box<dyn FnMut(&K, &V) + Send>;

/// Provides a map which evicts its least recently used entry once a configured
/// entry limit is exceeded.
///
/// # Examples
/// ```
/// # use callisto::lru::RecencyCache;
/// let mut cache: RecencyCache<String, i32> = RecencyCache::new(2, None);
///
/// cache.add("one".to_owned(), 1);
/// cache.add("two".to_owned(), 2);
///
/// // Reading "one" marks it as recently used...
/// assert_eq!(cache.get("one"), Some(&1));
///
/// // ...therefore the third entry will displace "two", not "one".
/// cache.add("three".to_owned(), 3);
/// assert_eq!(cache.get("one"), Some(&1));
/// assert_eq!(cache.get("two"), None);
/// assert_eq!(cache.get("three"), Some(&3));
/// ```
pub struct RecencyCache<K: Eq + Hash, V> {
    max_entries: usize,
    on_evicted: Option<EvictionCallback<K, V>>,
    map: LinkedHashMap<K, V>,
}

impl<K: Eq + Hash, V> RecencyCache<K, V> {
    /// Creates a new cache holding up to **max_entries** entries.
    ///
    /// Passing **0** as **max_entries** disables count based eviction entirely -
    /// the owner is then expected to drive eviction via
    /// [remove_oldest](RecencyCache::remove_oldest), e.g. to enforce a byte budget.
    ///
    /// The **on_evicted** callback is invoked for every entry leaving the cache,
    /// before its storage is released.
    pub fn new(max_entries: usize, on_evicted: Option<EvictionCallback<K, V>>) -> Self {
        RecencyCache {
            max_entries,
            on_evicted,
            map: LinkedHashMap::new(),
        }
    }

    /// Stores the given value for the given key and marks it as most recently used.
    ///
    /// If a value is already present for the key, it is replaced and reported to
    /// the eviction callback. This keeps derived bookkeeping (like byte budgets)
    /// consistent without special casing replacements.
    ///
    /// If the entry limit is exceeded by the insertion, the least recently used
    /// entry is evicted.
    pub fn add(&mut self, key: K, value: V) {
        if let Some(displaced) = self.map.remove(&key) {
            if let Some(callback) = &mut self.on_evicted {
                callback(&key, &displaced);
            }
        }

        let _ = self.map.insert(key, value);

        if self.max_entries > 0 && self.map.len() > self.max_entries {
            self.remove_oldest();
        }
    }

    /// Returns the value stored for the given key and marks it as most recently
    /// used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.map.get_refresh(key).map(|value| &*value)
    }

    /// Removes the entry for the given key if present, reporting it to the
    /// eviction callback.
    pub fn remove(&mut self, key: &K) {
        if let Some(value) = self.map.remove(key) {
            if let Some(callback) = &mut self.on_evicted {
                callback(key, &value);
            }
        }
    }

    /// Evicts the least recently used entry if the cache is non-empty.
    pub fn remove_oldest(&mut self) {
        if let Some((key, value)) = self.map.pop_front() {
            if let Some(callback) = &mut self.on_evicted {
                callback(&key, &value);
            }
        }
    }

    /// Returns the number of entries currently present.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::RecencyCache;
    use std::sync::{Arc, Mutex};

    /// Creates a cache which records all evicted keys in the returned vector.
    fn recording_cache(
        max_entries: usize,
    ) -> (RecencyCache<String, i32>, Arc<Mutex<Vec<String>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let recorder = evicted.clone();
        let cache = RecencyCache::new(
            max_entries,
            Some(Box::new(move |key: &String, _value: &i32| {
                recorder.lock().unwrap().push(key.clone());
            })),
        );

        (cache, evicted)
    }

    #[test]
    fn values_are_stored_and_retrieved() {
        let mut cache: RecencyCache<String, i32> = RecencyCache::new(0, None);

        cache.add("myKey".to_owned(), 1234);
        assert_eq!(cache.get("myKey"), Some(&1234));
        assert_eq!(cache.get("nonsense"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn removed_entries_are_gone() {
        let (mut cache, evicted) = recording_cache(0);

        cache.add("myKey".to_owned(), 1234);
        assert_eq!(cache.get("myKey"), Some(&1234));

        cache.remove(&"myKey".to_owned());
        assert_eq!(cache.get("myKey"), None);
        assert_eq!(cache.is_empty(), true);
        assert_eq!(*evicted.lock().unwrap(), vec!["myKey".to_owned()]);
    }

    #[test]
    fn eviction_follows_insertion_order() {
        let (mut cache, evicted) = recording_cache(20);

        // Insert 22 entries without any reads in between: the two oldest entries
        // must be evicted, in insertion order...
        for i in 0..22 {
            cache.add(format!("myKey{}", i), 1234);
        }

        assert_eq!(cache.len(), 20);
        assert_eq!(
            *evicted.lock().unwrap(),
            vec!["myKey0".to_owned(), "myKey1".to_owned()]
        );
    }

    #[test]
    fn recently_used_entries_survive() {
        let (mut cache, evicted) = recording_cache(2);

        cache.add("a".to_owned(), 1);
        cache.add("b".to_owned(), 2);

        // "a" becomes the most recently used entry...
        assert_eq!(cache.get("a"), Some(&1));

        // ...therefore inserting "c" evicts "b".
        cache.add("c".to_owned(), 3);
        assert_eq!(*evicted.lock().unwrap(), vec!["b".to_owned()]);
        assert_eq!(cache.get("a"), Some(&1));
        assert_eq!(cache.get("c"), Some(&3));
    }

    #[test]
    fn zero_max_entries_disables_count_eviction() {
        let (mut cache, evicted) = recording_cache(0);

        for i in 0..1000 {
            cache.add(format!("myKey{}", i), i);
        }

        assert_eq!(cache.len(), 1000);
        assert_eq!(evicted.lock().unwrap().is_empty(), true);
    }

    #[test]
    fn replacing_a_value_reports_the_displaced_one() {
        let displaced = Arc::new(Mutex::new(Vec::new()));
        let recorder = displaced.clone();
        let mut cache = RecencyCache::new(
            0,
            Some(Box::new(move |key: &String, value: &i32| {
                recorder.lock().unwrap().push((key.clone(), *value));
            })),
        );

        cache.add("myKey".to_owned(), 1);
        cache.add("myKey".to_owned(), 2);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("myKey"), Some(&2));
        assert_eq!(*displaced.lock().unwrap(), vec![("myKey".to_owned(), 1)]);
    }
}
