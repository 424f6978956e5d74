//! In-memory TTL cache with approximate LRU eviction.
//!
//! Expiry is enforced lazily on every read and proactively by an optional
//! periodic sweep. When the entry limit is reached, the entry with the oldest
//! `last_fetch_at` is evicted before a new key is inserted.
//!
//! Time is measured with `tokio::time::Instant` so paused-clock tests observe
//! exact expiry boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::util::lock;

/// A cached value with its freshness bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Content fingerprint (ETag) for conditional requests.
    pub fingerprint: Option<String>,
    pub last_fetch_at: Instant,
}

impl<T> CacheEntry<T> {
    /// `now > expires_at`; an entry is still valid at exactly `expires_at`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Remaining lifetime (zero once expired).
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Observability counters. Not load-bearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Capacity evictions.
    pub evictions: u64,
    /// Entries dropped because they expired (lazily or by the sweep).
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Generic key-value cache shared by the polling engine.
#[derive(Debug)]
pub struct MemoryCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    max_entries: usize,
    sweep_interval: Duration,
    counters: Counters,
}

impl<T> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            sweep_interval: config.sweep_interval,
            counters: Counters::default(),
        }
    }

    /// Cache with a custom entry limit and the default sweep interval.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(&CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    /// Get a live value. Expired entries are evicted here and reported as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        self.get_entry(key).map(|entry| entry.data)
    }

    /// Get a live entry including its metadata.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(key, "cache entry expired on read");
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value for `ttl`, optionally with a content fingerprint.
    pub fn set(&self, key: impl Into<String>, data: T, ttl: Duration, fingerprint: Option<String>) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            self.evict_oldest(&mut entries);
        }

        entries.insert(
            key.clone(),
            CacheEntry {
                key,
                data,
                created_at: now,
                expires_at: now + ttl,
                fingerprint,
                last_fetch_at: now,
            },
        );
    }

    /// Whether a live entry exists. Evicts the entry if it has expired.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => true,
            Some(_) => {
                entries.remove(key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    /// Remove one key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    /// Remove every key matching `pattern`. Returns the number removed.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|key, _| !pattern.is_match(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(pattern = %pattern, removed, "invalidated cache entries");
        }
        removed
    }

    /// Whether the key should be refetched: absent, expired, or within
    /// `threshold` of expiring.
    pub fn needs_refresh(&self, key: &str, threshold: Duration) -> bool {
        let now = Instant::now();
        match lock(&self.entries).get(key) {
            Some(entry) if !entry.is_expired_at(now) => entry.remaining_at(now) <= threshold,
            _ => true,
        }
    }

    /// Fingerprint of a live entry.
    pub fn fingerprint(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        lock(&self.entries)
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .and_then(|entry| entry.fingerprint.clone())
    }

    /// Renew a live entry after the remote confirmed it unchanged.
    pub fn touch(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match lock(&self.entries).get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.expires_at = now + ttl;
                entry.last_fetch_at = now;
                true
            }
            _ => false,
        }
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = entries.len(), "cache sweep");
        }
        removed
    }

    /// Start the periodic sweep. The task holds only a weak reference and
    /// stops when the cache is dropped or the handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        });
        SweeperHandle { task }
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn evict_oldest(&self, entries: &mut HashMap<String, CacheEntry<T>>) {
        let oldest = entries
            .values()
            .min_by_key(|entry| entry.last_fetch_at)
            .map(|entry| entry.key.clone());

        if let Some(key) = oldest {
            entries.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "evicted least recently fetched cache entry");
        }
    }
}

/// Handle to the background sweep task; aborts it on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
