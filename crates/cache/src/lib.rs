//! In-process TTL + LRU cache
//!
//! Each `TtlCache` is one namespace (`account`, `api_key`, `usage`, ...) with a
//! capacity and a default TTL. Expiry is lazy on read; a background sweep
//! removes expired entries that are never read again. When a new key arrives
//! at capacity, the least recently accessed entry is evicted.
//!
//! Time comes from `tokio::time::Instant` so tests can drive expiry with
//! `tokio::time::pause` and `advance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    created_at: Instant,
    access_count: u64,
    last_access: Instant,
    /// Monotonic access order; breaks ties between equal `last_access` instants
    access_seq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    next_seq: u64,
    counters: Counters,
}

impl<V> Inner<V> {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Point-in-time cache statistics for `/health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    pub size: usize,
    pub max_size: usize,
    pub avg_age_ms: f64,
    pub total_access_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_rate: f64,
}

pub struct TtlCache<V> {
    namespace: String,
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(namespace: impl Into<String>, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            max_size,
            default_ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
                counters: Counters::default(),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Clone of the value if present and not expired. An expired entry is
    /// dropped and counted as a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let seq = inner.bump_seq();

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.access_count += 1;
                entry.last_access = now;
                entry.access_seq = seq;
                let value = entry.value.clone();
                inner.counters.hits += 1;
                metrics::counter!("cache_lookups_total", "namespace" => self.namespace.clone(), "result" => "hit").increment(1);
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            inner.counters.expirations += 1;
        }
        inner.counters.misses += 1;
        metrics::counter!("cache_lookups_total", "namespace" => self.namespace.clone(), "result" => "miss").increment(1);
        None
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if self.max_size == 0 {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            self.evict_lru(&mut inner);
        }

        let seq = inner.bump_seq();
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                created_at: now,
                access_count: 0,
                last_access: now,
                access_seq: seq,
            },
        );
    }

    fn evict_lru(&self, inner: &mut Inner<V>) {
        let victim = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_access, e.access_seq))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            inner.entries.remove(&key);
            inner.counters.evictions += 1;
            debug!(namespace = %self.namespace, key = %key, "evicted least recently used entry");
        }
    }

    /// Remove `key`; returns whether it was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().await.entries.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| now < e.expires_at);
        let removed = before - inner.entries.len();
        inner.counters.expirations += removed as u64;
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let size = inner.entries.len();

        let total_age_ms: f64 = inner
            .entries
            .values()
            .map(|e| now.duration_since(e.created_at).as_secs_f64() * 1000.0)
            .sum();
        let total_access_count = inner.entries.values().map(|e| e.access_count).sum();
        let Counters {
            hits,
            misses,
            evictions,
            expirations,
        } = inner.counters;
        let lookups = hits + misses;

        CacheStats {
            namespace: self.namespace.clone(),
            size,
            max_size: self.max_size,
            avg_age_ms: if size == 0 { 0.0 } else { total_age_ms / size as f64 },
            total_access_count,
            hits,
            misses,
            evictions,
            expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Spawn a periodic sweep of `cache`. Abort the returned handle to stop it.
pub fn spawn_sweep_task<V: Clone + Send + Sync + 'static>(
    cache: Arc<TtlCache<V>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately and the cache starts empty
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = cache.sweep().await;
            if removed > 0 {
                debug!(namespace = %cache.namespace(), removed, "swept expired cache entries");
            }
        }
    })
}
