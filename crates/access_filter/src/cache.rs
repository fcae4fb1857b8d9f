//! Bounded, time-expiring cache of recent decisions.
//!
//! Backed by a `moka` cache configured for LRU eviction. Each entry expires
//! after its own decision TTL, counted from insertion; reads never extend it,
//! so a cached allow is always re-evaluated once its TTL runs out.

use crate::types::Decision;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached decision plus the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub decision: Decision,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn new(decision: Decision) -> Self {
        let expires_at = Instant::now() + decision.ttl;
        Self { decision, expires_at }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct DecisionExpiry;

impl Expiry<IpAddr, CacheEntry> for DecisionExpiry {
    fn expire_after_create(&self, _key: &IpAddr, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.decision.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &IpAddr,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // A replaced decision starts a fresh TTL
        Some(value.decision.ttl)
    }
}

/// Counters kept alongside the cache.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub capacity: u64,
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Thread-safe IP → decision cache.
pub struct DecisionCache {
    cache: Cache<IpAddr, CacheEntry>,
    enabled: bool,
    capacity: u64,
    counters: Arc<Counters>,
}

impl DecisionCache {
    /// Creates a cache holding at most `capacity` decisions.
    pub fn new(capacity: u64) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);

        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(DecisionExpiry)
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Size => {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Expired => {
                    listener_counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Explicit | RemovalCause::Replaced => {}
            })
            .build();

        Self {
            cache,
            enabled: true,
            capacity,
            counters,
        }
    }

    /// A cache that never stores anything; every lookup misses.
    pub fn disabled() -> Self {
        let mut cache = Self::new(0);
        cache.enabled = false;
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the cached decision for `ip` if one is present and unexpired.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&self, ip: &IpAddr) -> Option<Decision> {
        if !self.enabled {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.cache.get(ip) {
            Some(entry) if !entry.is_expired() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.decision)
            }
            Some(_) => {
                // Expired but not yet reaped by moka's housekeeping
                self.cache.invalidate(ip);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a decision; a concurrent writer for the same address wins or
    /// loses as a whole, never partially.
    pub fn put(&self, ip: IpAddr, decision: Decision) {
        if !self.enabled || decision.ttl.is_zero() {
            return;
        }
        self.cache.insert(ip, CacheEntry::new(decision));
    }

    /// Drops every cached decision.
    pub fn flush(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Runs pending housekeeping: reaps expired entries and applies evictions.
    pub fn sweep(&self) {
        self.cache.run_pending_tasks();
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            capacity: self.capacity,
            entries: self.cache.entry_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCache")
            .field("enabled", &self.enabled)
            .field("capacity", &self.capacity)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
