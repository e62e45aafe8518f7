//! Enforcement cache
//!
//! Decisions keyed by fingerprint, bounded by capacity and time-to-live.
//! At capacity expired entries are dropped first, then the least recently
//! accessed entry is evicted. Error decisions are never stored.

use parking_lot::Mutex;
use pgc_core::Decision;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Cache bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,

    /// Entries older than this are expired on lookup
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    /// `size / capacity`, 0 for a zero-capacity cache
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: Decision,
    inserted_at: Instant,
    last_accessed_at: Instant,
    /// Position in the access-order index
    access_seq: u64,
    /// Position in the insertion-order index
    insert_seq: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Access sequence number to fingerprint, oldest first
    order: BTreeMap<u64, String>,
    /// Insertion sequence number to fingerprint, oldest first. With a fixed
    /// TTL the expired entries are always a prefix of this index.
    inserted: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn touch(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.order.remove(&entry.access_seq);
        self.inserted.remove(&entry.insert_seq);
        Some(entry)
    }

    /// Drop every entry inserted `ttl` or more before `now`
    fn purge_expired(&mut self, now: Instant, ttl: Duration) {
        let mut purged = 0u64;
        while let Some((_, fingerprint)) = self.inserted.first_key_value() {
            let expired = self
                .entries
                .get(fingerprint)
                .map_or(true, |entry| now.duration_since(entry.inserted_at) >= ttl);
            if !expired {
                break;
            }
            let fingerprint = fingerprint.clone();
            if self.remove(&fingerprint).is_none() {
                self.inserted.pop_first();
                continue;
            }
            purged += 1;
        }
        if purged > 0 {
            self.expirations += purged;
            metrics::counter!("pgc_cache_expirations_total").increment(purged);
            trace!(purged, "Purged expired cache entries");
        }
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, fingerprint)) = self.order.pop_first() {
            if let Some(entry) = self.entries.remove(&fingerprint) {
                self.inserted.remove(&entry.insert_seq);
                trace!(
                    fingerprint = %fingerprint,
                    idle_ms = entry.last_accessed_at.elapsed().as_millis() as u64,
                    "Evicted cache entry"
                );
            }
            self.evictions += 1;
            metrics::counter!("pgc_cache_evictions_total").increment(1);
        }
    }
}

/// Thread-safe decision cache
#[derive(Debug)]
pub struct EnforcementCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl EnforcementCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Cache bounds
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Look up a decision, removing it if it has expired
    pub fn get(&self, fingerprint: &str) -> Option<Decision> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(entry) = inner.entries.get(fingerprint) else {
            inner.misses += 1;
            metrics::counter!("pgc_cache_lookups_total", "result" => "miss").increment(1);
            return None;
        };

        if now.duration_since(entry.inserted_at) >= self.config.ttl {
            inner.remove(fingerprint);
            inner.expirations += 1;
            inner.misses += 1;
            metrics::counter!("pgc_cache_lookups_total", "result" => "expired").increment(1);
            return None;
        }

        let seq = inner.touch();
        let entry = inner.entries.get_mut(fingerprint)?;
        let previous = std::mem::replace(&mut entry.access_seq, seq);
        entry.last_accessed_at = now;
        let decision = entry.decision.clone();

        inner.order.remove(&previous);
        inner.order.insert(seq, fingerprint.to_string());
        inner.hits += 1;
        metrics::counter!("pgc_cache_lookups_total", "result" => "hit").increment(1);

        Some(decision)
    }

    /// Store a decision. Error decisions are ignored.
    pub fn put(&self, fingerprint: impl Into<String>, decision: Decision) {
        if !decision.is_cacheable() || self.config.capacity == 0 {
            return;
        }

        let fingerprint = fingerprint.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.remove(&fingerprint).is_none() && inner.entries.len() >= self.config.capacity {
            inner.purge_expired(now, self.config.ttl);
            while inner.entries.len() >= self.config.capacity {
                inner.evict_least_recent();
            }
        }

        let seq = inner.touch();
        inner.order.insert(seq, fingerprint.clone());
        inner.inserted.insert(seq, fingerprint.clone());
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                decision,
                inserted_at: now,
                last_accessed_at: now,
                access_seq: seq,
                insert_seq: seq,
            },
        );
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.inserted.clear();
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now(), self.config.ttl);
        inner.entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics, expired entries excluded
    pub fn stats(&self) -> CacheStats {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now(), self.config.ttl);
        let size = inner.entries.len();
        let utilization = if self.config.capacity == 0 {
            0.0
        } else {
            size as f64 / self.config.capacity as f64
        };

        CacheStats {
            size,
            capacity: self.config.capacity,
            ttl_seconds: self.config.ttl.as_secs(),
            utilization,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }
}

impl Default for EnforcementCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
