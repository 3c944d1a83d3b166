//! Process-local caches for the query path.
//!
//! Two caches with distinct lifetimes: query results (LRU, per-entry TTL)
//! and tokenized queries (LRU, insertion-order eviction, no TTL). Every
//! index mutation funnels through `invalidate()` on the result cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const QUERY_CACHE_CAPACITY: usize = 100;
pub const QUERY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const TOKEN_CACHE_CAPACITY: usize = 100;

/// Observability snapshot shared by both caches.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// ---------------------------------------------------------------------------
// Query-result cache: LRU + TTL
// ---------------------------------------------------------------------------

struct ResultEntry<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

struct ResultCacheInner<V> {
    entries: HashMap<String, ResultEntry<V>>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// LRU cache with a per-entry TTL. `get` on an expired key counts as a miss
/// and drops the entry; `set` over capacity evicts the least-recently-used.
pub struct QueryResultCache<V> {
    inner: Mutex<ResultCacheInner<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> Default for QueryResultCache<V> {
    fn default() -> Self {
        Self::new(QUERY_CACHE_CAPACITY, QUERY_CACHE_TTL)
    }
}

impl<V: Clone> QueryResultCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(ResultCacheInner {
                entries: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = tick;
                inner.hits += 1;
                Some(inner.entries[key].value.clone())
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: String, value: V) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            ResultEntry { value, expires_at: Instant::now() + self.ttl, last_used: tick },
        );
    }

    /// Drop everything and reset the counters. Called after every successful
    /// index mutation.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            max_size: self.capacity,
            hit_rate: hit_rate(inner.hits, inner.misses),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResultCacheInner<V>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query-token cache: insertion-order eviction, no TTL
// ---------------------------------------------------------------------------

struct TokenCacheInner {
    entries: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Small cache mapping raw query strings to their deduplicated token lists.
/// Oldest-inserted entries are evicted on overflow.
pub struct QueryTokenCache {
    inner: Mutex<TokenCacheInner>,
    capacity: usize,
}

impl Default for QueryTokenCache {
    fn default() -> Self {
        Self::new(TOKEN_CACHE_CAPACITY)
    }
}

impl QueryTokenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TokenCacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<String>> {
        let mut inner = self.lock();
        match inner.entries.get(query).cloned() {
            Some(tokens) => {
                inner.hits += 1;
                Some(tokens)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, query: String, tokens: Vec<String>) {
        let mut inner = self.lock();
        if inner.entries.insert(query.clone(), tokens).is_none() {
            inner.order.push_back(query);
            while inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            max_size: self.capacity,
            hit_rate: hit_rate(inner.hits, inner.misses),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenCacheInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_cache_hit_and_miss() {
        let cache: QueryResultCache<u32> = QueryResultCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get("k"), None);
        cache.set("k".into(), 7);
        assert_eq!(cache.get("k"), Some(7));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_result_cache_ttl_expiry_counts_as_miss() {
        let cache: QueryResultCache<u32> = QueryResultCache::new(10, Duration::from_millis(0));
        cache.set("k".into(), 7);
        assert_eq!(cache.get("k"), None, "expired entry is a miss");
        assert_eq!(cache.len(), 0, "expired entry is removed");
    }

    #[test]
    fn test_result_cache_lru_eviction() {
        let cache: QueryResultCache<u32> = QueryResultCache::new(2, Duration::from_secs(60));
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        assert_eq!(cache.get("a"), Some(1)); // a is now most recent
        cache.set("c".into(), 3); // evicts b
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_invalidate_clears_entries_and_counters() {
        let cache: QueryResultCache<u32> = QueryResultCache::new(10, Duration::from_secs(60));
        cache.set("k".into(), 7);
        let _ = cache.get("k");
        let _ = cache.get("absent");
        cache.invalidate();
        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[test]
    fn test_token_cache_fifo_eviction() {
        let cache = QueryTokenCache::new(2);
        cache.set("q1".into(), vec!["a".into()]);
        cache.set("q2".into(), vec!["b".into()]);
        let _ = cache.get("q1"); // recency must NOT matter here
        cache.set("q3".into(), vec!["c".into()]);
        assert_eq!(cache.get("q1"), None, "oldest-inserted is evicted");
        assert!(cache.get("q2").is_some());
        assert!(cache.get("q3").is_some());
    }

    #[test]
    fn test_token_cache_overwrite_does_not_grow_order() {
        let cache = QueryTokenCache::new(2);
        cache.set("q".into(), vec!["a".into()]);
        cache.set("q".into(), vec!["b".into()]);
        assert_eq!(cache.get("q"), Some(vec!["b".to_string()]));
        assert_eq!(cache.stats().size, 1);
    }
}
