//! TTL cache with LRU eviction
//!
//! Shared by the tokenizer, summarizer, optimizer, and orchestrator to avoid
//! recomputation and repeated settings reads. Entries expire lazily on the
//! read that discovers them and eagerly on a periodic background sweep.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct TtlCacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for TtlCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    hits: u64,
    misses: u64,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage rounded to 2 decimals; 0 when no accesses have occurred.
    pub hit_rate: f64,
    pub oldest_entry_age_ms: u64,
    pub memory_usage_kb: u64,
}

/// Generic TTL cache with least-recently-accessed eviction.
pub struct TtlCache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    config: TtlCacheConfig,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new(config: TtlCacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            })),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TtlCacheConfig::default())
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.config.default_ttl);
    }

    /// Insert with an explicit TTL. At capacity, inserting a new key evicts
    /// the least-recently-accessed entry first.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();

        if inner.entries.len() >= self.config.max_entries && !inner.entries.contains_key(key) {
            if let Some(evict) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&evict);
            }
        }

        let now = Instant::now();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed_at: now,
            },
        );
    }

    /// Fetch a value. Absent if never set or stale per TTL; a stale entry is
    /// deleted by the read that discovers it. Every call counts a global hit
    /// or miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.entries.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.last_accessed_at = Instant::now();
            entry.value.clone()
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.remove(key).is_some()
    }

    /// Delete every key matching `pattern`; returns the number deleted.
    pub fn invalidate(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !pattern.is_match(key));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete all stale entries regardless of access; returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired());
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            (inner.hits as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        let oldest_entry_age_ms = inner
            .entries
            .values()
            .map(|e| e.created_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);

        let entry_overhead = std::mem::size_of::<Entry<V>>();
        let memory_usage_kb = inner
            .entries
            .keys()
            .map(|k| k.len() + entry_overhead)
            .sum::<usize>() as u64
            / 1024;

        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
            oldest_entry_age_ms,
            memory_usage_kb,
        }
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    /// Spawn the periodic eager sweep. Runs forever on a fixed interval
    /// independent of traffic; a sweep can only shrink the map, so the loop
    /// never exits on its own.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, "Cache sweep removed stale entries");
                }
            }
        })
    }
}

/// Shared key naming helpers so independent components never collide on
/// ad hoc strings.
pub mod keys {
    pub fn user_settings(user_id: &str) -> String {
        format!("user:{}:settings", user_id)
    }

    pub fn system_settings() -> String {
        "system:settings".to_string()
    }

    pub fn system_stats() -> String {
        "stats:system".to_string()
    }

    pub fn token_count(content_key: &str) -> String {
        format!("tokens:{}", content_key)
    }

    pub fn summary(request_hash: &str) -> String {
        format!("summary:{}", request_hash)
    }

    pub fn recommendation() -> String {
        "optimizer:recommendation".to_string()
    }
}
