//! TTL result cache and per-statement performance baselines.
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::db::ConnectionDescriptor;

const KEY_SEED: u64 = 0x5153_4c50_494c_4f54;

/// Stable content hash. Identical inputs yield identical keys across
/// processes and restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(u64);

impl CacheKey {
    fn from_parts(domain: &str, parts: &[&str]) -> Self {
        let mut hasher = Xxh64::new(KEY_SEED);
        for part in std::iter::once(&domain).chain(parts) {
            // length prefix keeps ("ab", "c") apart from ("a", "bc")
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        CacheKey(hasher.digest())
    }

    /// Key for an execution result on a specific database.
    pub fn for_query(descriptor: &ConnectionDescriptor, sql: &str) -> Self {
        Self::from_parts(
            "query",
            &[
                sql,
                descriptor.connection_string(),
                descriptor.database_type().name(),
            ],
        )
    }

    /// Key for generated SQL at the prompt layer.
    pub fn for_prompt(prompt: &str, model: &str, service: &str, complexity_level: &str) -> Self {
        Self::from_parts("prompt", &[prompt, model, service, complexity_level])
    }

    /// Key for a baseline, which is shared by every database running the text.
    pub fn for_sql(sql: &str) -> Self {
        Self::from_parts("sql", &[sql])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub cached_at: DateTime<Utc>,
    stored: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored.elapsed() < ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Capacity-bounded LRU with a fixed time-to-live per entry.
///
/// Expired entries read as a miss and are dropped on access;
/// `purge_expired` sweeps the rest.
pub struct ResultCache<V> {
    ttl: Duration,
    entries: Mutex<LruCache<CacheKey, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let mut entries = self.entries.lock();
        let fresh = match entries.peek(key).map(|e| e.is_fresh(self.ttl)) {
            Some(true) => entries.get(key).cloned(),
            Some(false) => {
                entries.pop(key);
                debug!(key = %key, "cache entry expired");
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if fresh.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    /// Insert or overwrite, evicting the least recently used entry when full.
    pub fn put(&self, key: CacheKey, value: V) {
        let entry = CacheEntry {
            key,
            value,
            cached_at: Utc::now(),
            stored: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.lock().push(key, entry) {
            if evicted != key {
                debug!(key = %evicted, "cache entry evicted");
            }
        }
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drop every entry whose value fails the predicate.
    pub fn retain(&self, mut keep: impl FnMut(&V) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| !keep(&e.value))
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| !e.is_fresh(self.ttl))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceBaseline {
    pub query_hash: CacheKey,
    pub execution_count: u64,
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
    pub total_rows_returned: u64,
    pub last_executed: DateTime<Utc>,
}

/// Running execution statistics per SQL text.
pub struct BaselineStore {
    baselines: Mutex<LruCache<CacheKey, PerformanceBaseline>>,
}

impl BaselineStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            baselines: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fold one execution into the baseline. The read-modify-write happens
    /// under a single lock acquisition.
    pub fn record(&self, sql: &str, execution_time_ms: u64, rows_returned: usize) -> PerformanceBaseline {
        let key = CacheKey::for_sql(sql);
        let now = Utc::now();
        let mut baselines = self.baselines.lock();
        let baseline = baselines.get_or_insert_mut(key, || PerformanceBaseline {
            query_hash: key,
            execution_count: 0,
            total_execution_time_ms: 0,
            average_execution_time_ms: 0.0,
            total_rows_returned: 0,
            last_executed: now,
        });
        baseline.execution_count += 1;
        baseline.total_execution_time_ms += execution_time_ms;
        baseline.total_rows_returned += rows_returned as u64;
        baseline.average_execution_time_ms =
            baseline.total_execution_time_ms as f64 / baseline.execution_count as f64;
        baseline.last_executed = now;
        baseline.clone()
    }

    pub fn get(&self, sql: &str) -> Option<PerformanceBaseline> {
        self.baselines.lock().peek(&CacheKey::for_sql(sql)).cloned()
    }

    pub fn len(&self) -> usize {
        self.baselines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
