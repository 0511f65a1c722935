//! A bounded key-value cache combining LRU eviction with time-based expiry.
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

/// A bounded cache that evicts the least-recently-used entry under capacity pressure and expires
/// entries by age.
///
/// Expiry is checked lazily on read only — there is no background sweep, so an entry may outlive
/// its TTL in storage until it is read or evicted by capacity pressure. Callers only observe
/// expiry semantics at read time.
pub struct TtlLruCache<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> TtlLruCache<K, V> {
    /// Create a cache bounded to `capacity` entries with the given time-to-live. Capacity and TTL
    /// are fixed for the lifetime of the cache. A zero capacity is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> TtlLruCache<K, V> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        TtlLruCache {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Insert or refresh an entry, evicting the least-recently-used entry when at capacity.
    /// Inserting resets the entry's age.
    pub fn put(&mut self, key: K, value: V) {
        self.entries.put(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    /// Get the value for `key` if present and not expired. A hit counts as an access and moves
    /// the entry to the most-recently-used position; an expired entry is removed and reported as
    /// a miss.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some(entry) = self.entries.peek(key) {
            if entry.created_at.elapsed() > self.ttl {
                self.entries.pop(key);
                return None;
            }
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Remove the entry for `key`, if any.
    pub fn remove(&mut self, key: &K) {
        self.entries.pop(key);
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including entries past their TTL that have not been read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
