//! Process-local TTL cache shared by the search executor and the image
//! search path. Generalizes the teacher's inline `lru::LruCache` caches
//! (`embeddings/e5.rs`, `embeddings/tokenizer.rs`) into a reusable type that
//! tests can construct and reset directly, per the "owned by an injectable
//! `CacheManager`" design note.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A TTL + LRU bounded cache. `TTL = Duration::ZERO` disables caching
/// entirely (every `get_or_insert_with` call is a miss), matching the
/// "Cache TTL = 0: never caches" boundary behavior.
pub struct TtlCache<K, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            guard.pop(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        let mut guard = self.inner.lock();
        guard.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        // Eldest-half eviction on overflow: LruCache::put already evicts a
        // single LRU entry once `cap` is exceeded, which satisfies the
        // bound; for a harder reset (e.g. after a bulk invalidation) callers
        // use `invalidate_all`.
    }

    /// Drop every cached entry for which `predicate` returns true. Used by
    /// `invalidate(index_id)` to clear just the entries for one shard.
    pub fn invalidate_matching(&self, mut predicate: impl FnMut(&K) -> bool) {
        let mut guard = self.inner.lock();
        let doomed: Vec<K> = guard
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            guard.pop(&k);
        }
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evict the least-recently-used half of a cache when it overflows its
/// configured bound by more than a burst factor. The teacher's `lru` crate
/// already evicts one entry per overflowing `put`; this helper is used by
/// callers (e.g. a bulk-ingest invalidation) that want to proactively halve
/// the cache rather than let it drain one entry at a time.
pub fn evict_eldest_half<K, V>(cache: &TtlCache<K, V>)
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    let mut guard = cache.inner.lock();
    let to_remove = guard.len() / 2;
    let mut removed = 0;
    while removed < to_remove {
        if guard.pop_lru().is_none() {
            break;
        }
        removed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_never_caches() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::ZERO);
        cache.insert("k".to_string(), 1);
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn hit_then_expiry() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::from_millis(20));
        cache.insert("k".to_string(), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn invalidate_matching_clears_only_matched_keys() {
        let cache: TtlCache<String, u32> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert("idx-a:q1".to_string(), 1);
        cache.insert("idx-b:q1".to_string(), 2);
        cache.invalidate_matching(|k| k.starts_with("idx-a"));
        assert_eq!(cache.get(&"idx-a:q1".to_string()), None);
        assert_eq!(cache.get(&"idx-b:q1".to_string()), Some(2));
    }

    #[test]
    fn eldest_half_eviction_halves_population() {
        let cache: TtlCache<u32, u32> = TtlCache::new(100, Duration::from_secs(60));
        for i in 0..10u32 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 10);
        evict_eldest_half(&cache);
        assert_eq!(cache.len(), 5);
    }
}
