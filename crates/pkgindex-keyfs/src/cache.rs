//! Read-path caches
//!
//! Two LRU pools sit in front of the changelog table:
//!
//! - the **changelog pool** (about 1/20 of the configured budget) holds
//!   whole decoded changelog entries keyed by serial, plus resolved values
//!   too big to be worth keeping per key;
//! - the **relpath pool** (the rest) holds small resolved
//!   `(serial, back_serial, value)` triples keyed by `(serial, relpath)`.
//!
//! Pools never evict into each other. Cached values are `Arc` snapshots
//! and are never mutated in place, so population (insert/evict) is the
//! only state change and has no effect on correctness.

use crate::changelog::{ChangelogEntry, RelpathAt, Value};
use lru::LruCache;
use parking_lot::Mutex;
use pkgindex_common::Serial;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Total lookups (hits + misses)
    pub fn lookups(&self) -> u64 {
        self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed)
    }
}

/// Thread-safe LRU pool with statistics
pub struct LruPool<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, V>>,
    stats: CacheStats,
}

impl<K: Hash + Eq, V: Clone> LruPool<K, V> {
    /// Create a pool holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Look up an entry, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(value.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert an entry, evicting the least recently used one when full
    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        let replaces = entries.contains(&key);
        if entries.push(key, value).is_some() && !replaces {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Check for an entry without touching LRU order or statistics
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains(key)
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Get pool statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Key of the changelog pool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangelogKey {
    /// Whole changelog entry of a serial
    Entry(Serial),
    /// Oversized resolved value of a relpath at a serial
    Resolved(Serial, String),
}

/// Value of the changelog pool
#[derive(Clone, Debug)]
pub enum ChangelogItem {
    Entry(Arc<ChangelogEntry>),
    Resolved(RelpathAt),
}

/// The two read-path pools sized from one budget
pub struct ReadCache {
    changelog: LruPool<ChangelogKey, ChangelogItem>,
    relpath: LruPool<(Serial, String), RelpathAt>,
    big_value_threshold: usize,
}

impl ReadCache {
    /// Split `cache_size` entries between both pools
    pub fn new(cache_size: usize, big_value_threshold: usize) -> Self {
        let changelog_size = (cache_size / 20).max(1);
        let relpath_size = cache_size.saturating_sub(changelog_size).max(1);
        Self {
            changelog: LruPool::new(changelog_size),
            relpath: LruPool::new(relpath_size),
            big_value_threshold,
        }
    }

    /// Cached whole changelog entry
    pub fn get_entry(&self, serial: Serial) -> Option<Arc<ChangelogEntry>> {
        match self.changelog.get(&ChangelogKey::Entry(serial)) {
            Some(ChangelogItem::Entry(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Cache a whole changelog entry
    pub fn put_entry(&self, serial: Serial, entry: Arc<ChangelogEntry>) {
        self.changelog
            .put(ChangelogKey::Entry(serial), ChangelogItem::Entry(entry));
    }

    /// Look up the value of `relpath` visible at `serial`.
    ///
    /// Checks the relpath pool, then oversized values in the changelog
    /// pool, then a cached whole entry written exactly at `serial`.
    pub fn get_relpath_at(&self, relpath: &str, serial: Serial) -> Option<RelpathAt> {
        let key = (serial, relpath.to_string());
        if let Some(found) = self.relpath.get(&key) {
            return Some(found);
        }
        let (serial, relpath) = key;
        if let Some(ChangelogItem::Resolved(found)) =
            self.changelog.get(&ChangelogKey::Resolved(serial, relpath.clone()))
        {
            return Some(found);
        }
        self.get_entry(serial)
            .and_then(|entry| entry.relpath_at(&relpath, serial))
    }

    /// Remember a resolved value, choosing the pool by its size
    pub fn put_relpath_at(&self, relpath: &str, serial: Serial, resolved: RelpathAt) {
        let is_big = resolved
            .value
            .as_deref()
            .is_some_and(|v| estimate_size(v, self.big_value_threshold).is_none());
        if is_big {
            self.changelog.put(
                ChangelogKey::Resolved(serial, relpath.to_string()),
                ChangelogItem::Resolved(resolved),
            );
        } else {
            self.relpath.put((serial, relpath.to_string()), resolved);
        }
    }

    /// The changelog pool
    pub fn changelog_pool(&self) -> &LruPool<ChangelogKey, ChangelogItem> {
        &self.changelog
    }

    /// The relpath pool
    pub fn relpath_pool(&self) -> &LruPool<(Serial, String), RelpathAt> {
        &self.relpath
    }

    /// Metrics in `(name, kind, value)` form, combined and per pool
    pub fn metrics(&self) -> Vec<(&'static str, &'static str, u64)> {
        let cl = self.changelog.stats();
        let rp = self.relpath.stats();
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let cl_size = self.changelog.len() as u64;
        let rp_size = self.relpath.len() as u64;
        vec![
            ("storage_cache_evictions", "counter", load(&cl.evictions) + load(&rp.evictions)),
            ("storage_cache_hits", "counter", load(&cl.hits) + load(&rp.hits)),
            ("storage_cache_lookups", "counter", cl.lookups() + rp.lookups()),
            ("storage_cache_misses", "counter", load(&cl.misses) + load(&rp.misses)),
            ("storage_cache_size", "gauge", cl_size + rp_size),
            ("changelog_cache_evictions", "counter", load(&cl.evictions)),
            ("changelog_cache_hits", "counter", load(&cl.hits)),
            ("changelog_cache_lookups", "counter", cl.lookups()),
            ("changelog_cache_misses", "counter", load(&cl.misses)),
            ("changelog_cache_size", "gauge", self.changelog.capacity() as u64),
            ("changelog_cache_items", "gauge", cl_size),
            ("relpath_cache_evictions", "counter", load(&rp.evictions)),
            ("relpath_cache_hits", "counter", load(&rp.hits)),
            ("relpath_cache_lookups", "counter", rp.lookups()),
            ("relpath_cache_misses", "counter", load(&rp.misses)),
            ("relpath_cache_size", "gauge", self.relpath.capacity() as u64),
            ("relpath_cache_items", "gauge", rp_size),
        ]
    }
}

/// Rough in-memory size of a JSON value.
///
/// Returns `None` as soon as the running total exceeds `max`, so huge
/// values are not walked completely.
pub fn estimate_size(value: &Value, max: usize) -> Option<usize> {
    fn walk(value: &Value, total: &mut usize, max: usize) -> bool {
        *total += std::mem::size_of::<Value>();
        match value {
            Value::String(s) => *total += s.len(),
            Value::Array(items) => {
                for item in items {
                    if !walk(item, total, max) {
                        return false;
                    }
                }
            }
            Value::Object(map) => {
                for (k, v) in map {
                    *total += k.len();
                    if !walk(v, total, max) {
                        return false;
                    }
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        *total <= max
    }

    let mut total = 0;
    walk(value, &mut total, max).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved(serial: Serial, value: Value) -> RelpathAt {
        RelpathAt {
            serial,
            back_serial: None,
            value: Some(Arc::new(value)),
        }
    }

    #[test]
    fn test_pool_insert_and_get() {
        let pool: LruPool<u64, u64> = LruPool::new(10);
        pool.put(1, 100);
        assert_eq!(pool.get(&1), Some(100));
        assert_eq!(pool.get(&2), None);
        assert_eq!(pool.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().lookups(), 2);
    }

    #[test]
    fn test_pool_lru_ordering() {
        let pool: LruPool<u64, u64> = LruPool::new(2);
        pool.put(1, 1);
        pool.put(2, 2);

        // Access entry 1 to make it more recent
        pool.get(&1);

        // Insert entry 3, should evict entry 2 (LRU)
        pool.put(3, 3);

        assert!(pool.contains(&1));
        assert!(!pool.contains(&2));
        assert!(pool.contains(&3));
        assert_eq!(pool.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_pool_replace_is_not_eviction() {
        let pool: LruPool<u64, u64> = LruPool::new(2);
        pool.put(1, 1);
        pool.put(1, 2);
        assert_eq!(pool.get(&1), Some(2));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().evictions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pool_sizes_from_budget() {
        let cache = ReadCache::new(1000, 100_000);
        assert_eq!(cache.changelog_pool().capacity(), 50);
        assert_eq!(cache.relpath_pool().capacity(), 950);

        let tiny = ReadCache::new(1, 100_000);
        assert_eq!(tiny.changelog_pool().capacity(), 1);
        assert_eq!(tiny.relpath_pool().capacity(), 1);
    }

    #[test]
    fn test_small_values_go_to_relpath_pool() {
        let cache = ReadCache::new(100, 1000);
        cache.put_relpath_at("a", 3, resolved(2, json!({"x": 1})));
        assert_eq!(cache.relpath_pool().len(), 1);
        assert!(cache.changelog_pool().is_empty());
        assert_eq!(cache.get_relpath_at("a", 3).unwrap().serial, 2);
    }

    #[test]
    fn test_big_values_go_to_changelog_pool() {
        let cache = ReadCache::new(100, 1000);
        let big = json!({"links": vec!["x".repeat(100); 50]});
        cache.put_relpath_at("a", 3, resolved(3, big));
        assert!(cache.relpath_pool().is_empty());
        assert_eq!(cache.changelog_pool().len(), 1);
        assert!(cache.get_relpath_at("a", 3).is_some());
    }

    #[test]
    fn test_lookup_falls_back_to_whole_entry() {
        let cache = ReadCache::new(100, 1000);
        let mut entry = ChangelogEntry::default();
        entry.changes.insert(
            "a".into(),
            crate::changelog::ChangeRecord {
                keyname: "K".into(),
                back_serial: Some(1),
                value: Some(Arc::new(json!(5))),
            },
        );
        cache.put_entry(4, Arc::new(entry));
        let found = cache.get_relpath_at("a", 4).unwrap();
        assert_eq!(found.serial, 4);
        assert_eq!(found.back_serial, Some(1));
        assert!(cache.get_relpath_at("a", 5).is_none());
        assert!(cache.get_relpath_at("b", 4).is_none());
    }

    #[test]
    fn test_estimate_size_cutoff() {
        assert!(estimate_size(&json!({"a": "b"}), 1000).is_some());
        assert!(estimate_size(&json!("x".repeat(2000)), 1000).is_none());
    }

    #[test]
    fn test_metrics_names() {
        let cache = ReadCache::new(100, 1000);
        cache.get_relpath_at("a", 1);
        let metrics = cache.metrics();
        let lookups = metrics
            .iter()
            .find(|(name, _, _)| *name == "storage_cache_lookups")
            .unwrap();
        assert!(lookups.2 >= 1);
        assert_eq!(metrics.len(), 17);
    }
}
