//! TTL- and size-bounded cache of query results.
//!
//! This module provides the result cache sitting in front of the live
//! query path:
//! - Canonical keys (see [`key`]) deduplicate equivalent queries
//! - Every entry carries its own TTL; expiry is `now - created_at > ttl`
//! - At capacity, the entry with the oldest `created_at` is evicted
//!   (creation-order eviction, deliberately not LRU)
//! - A background sweep task removes expired entries on an interval
//!
//! Cache misses never fail: callers always fall through to a live fetch.

pub mod key;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::QueryResult;

/// Configuration for cache behavior.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one
    pub default_ttl: Duration,

    /// Maximum number of entries before creation-order eviction kicks in
    pub max_size: usize,

    /// Interval between background expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            max_size: 1000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// A cached result. Immutable once inserted; only replaced or removed.
struct CacheEntry {
    result: QueryResult,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub max_size: usize,
}

/// TTL-bounded query result cache with creation-order eviction.
pub struct MetricCache {
    /// The entry map is the only shared mutable state; counters are
    /// atomics so `get` can stay on the read side of the lock.
    entries: RwLock<HashMap<String, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MetricCache {
    /// Create a cache and start its background sweep task.
    ///
    /// The cache must be stopped with [`MetricCache::stop`] on shutdown
    /// to join the sweeper.
    pub fn new(config: CacheConfig) -> std::sync::Arc<Self> {
        let cache = std::sync::Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sweeper: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let handle = tokio::spawn(Self::sweep_loop(
            std::sync::Arc::clone(&cache),
            cache.shutdown.clone(),
        ));
        *cache.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        cache
    }

    /// Look up a result. Expired entries count as misses and are left
    /// for the sweeper, keeping lock hold time minimal.
    pub async fn get(&self, key: &str) -> Option<QueryResult> {
        let now = Instant::now();
        let entries = self.entries.read().await;

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a result. `ttl` of `None` applies the configured default.
    ///
    /// When the map is full and `key` is new, exactly one entry is
    /// evicted: the one with the smallest `created_at`.
    pub async fn set(&self, key: String, result: QueryResult, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            self.evict_oldest(&mut entries);
        }

        entries.insert(
            key,
            CacheEntry {
                result,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove one entry.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Drop all entries. Statistics are kept.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let dropped = entries.len();
        entries.clear();
        info!(dropped, "cache cleared");
    }

    /// Read-only statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        CacheStats {
            entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            max_size: self.config.max_size,
        }
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!("cache sweeper stopped");
        }
    }

    fn evict_oldest(&self, entries: &mut HashMap<String, CacheEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "evicted oldest cache entry");
        }
    }

    async fn sweep_loop(cache: std::sync::Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(cache.config.sweep_interval);
        // The first tick fires immediately; skip it so a fresh cache
        // isn't swept before anything is inserted.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => cache.sweep().await,
            }
        }
    }

    /// Remove every expired entry, independent of capacity pressure.
    async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept expired cache entries");
        }
    }
}
