//! Bounded response cache with per-entry TTL and LRU eviction.
//!
//! [`ResponseCache`] stores raw upstream payloads keyed on the descriptor's
//! cache key (endpoint class + normalized parameters). Each entry carries
//! its own TTL, so one cache serves endpoint classes with very different
//! freshness needs (player counts for two minutes, store pages for an hour).
//!
//! # Expiry
//!
//! An entry is logically absent once `now - inserted_at > ttl`. Expired
//! entries are not swept in the background: a read that finds one removes
//! it and reports a miss, and [`ResponseCache::purge_expired()`] can be
//! called periodically to reclaim the rest.
//!
//! # Eviction
//!
//! The number of entries never exceeds the configured capacity. A put of a
//! new key into a full cache evicts the least-recently-accessed entry, where
//! both `get` hits and `put`s count as access.
//!
//! # Clock
//!
//! Timestamps come from [`tokio::time::Instant`], so tests running on a
//! paused runtime control expiry with `tokio::time::advance`.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::Payload;

/// Configuration for the response cache.
///
/// ```rust
/// # use heimdall::CacheConfig;
/// let config = CacheConfig::new().max_entries(500);
/// assert_eq!(config.max_entries, 500);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 1,000.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1_000 }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Payload,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Point-in-time cache counters for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-memory LRU + TTL cache of upstream payloads.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live entry and mark it most recently used.
    ///
    /// Returns `None` if the key is absent or its entry has expired; an
    /// expired entry is removed on the way out.
    pub fn get(&self, key: &str) -> Option<Payload> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            entries.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache entry expired");
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_accessed_at = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert or overwrite an entry, evicting the LRU entry if full.
    pub fn put(&self, key: impl Into<String>, value: Payload, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            ttl,
            last_accessed_at: now,
        };

        let evicted = self.entries.lock().push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(1);
            debug!(key = %evicted_key, "evicted least recently used cache entry");
        }
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    /// Time since an entry was last read or written, if present.
    pub fn idle_time(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .map(|e| Instant::now().saturating_duration_since(e.last_accessed_at))
    }

    /// Number of physically present entries (expired ones included until purged).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let cache = ResponseCache::new(&CacheConfig::new().max_entries(0));
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn overwrite_does_not_count_as_eviction() {
        let cache = ResponseCache::new(&CacheConfig::new().max_entries(2));
        cache.put("a", Payload::from("1"), TTL);
        cache.put("a", Payload::from("2"), TTL);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(Payload::from("2")));
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = ResponseCache::default();
        cache.put("a", Payload::from("1"), TTL);
        cache.get("a");
        cache.get("b");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn invalidate_reports_presence() {
        let cache = ResponseCache::default();
        cache.put("a", Payload::from("1"), TTL);
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
    }
}
