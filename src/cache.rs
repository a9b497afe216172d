//! TTL + LRU cache of fused enrichment results.
//!
//! Keys are normalized `(value, type)` pairs. Expiry is checked on
//! access and swept proactively by a background ticker the cache owns;
//! eviction at capacity removes the entry with the oldest
//! `last_accessed` stamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::models::{FusedResult, Indicator, IocType};

/// Runtime-mutable cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries: 10_000,
            sweep_interval_secs: 300,
        }
    }
}

/// One cached fusion with its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: FusedResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Counters reported by [`EnrichmentCache::stats`]
#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<(String, IocType), CacheEntry>,
    config: CacheConfig,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Shared enrichment cache. Cheap to clone via `Arc`; all mutation is
/// internally synchronized.
pub struct EnrichmentCache {
    inner: Arc<RwLock<CacheInner>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EnrichmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                config,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
            sweeper: Mutex::new(None),
        }
    }

    /// Normalized lookup. Expired entries count as misses and are
    /// removed on the spot.
    pub fn get(&self, indicator: &Indicator) -> Option<FusedResult> {
        let key = indicator.cache_key();
        let now = Utc::now();
        let mut inner = self.inner.write();

        if !inner.config.enabled {
            inner.misses += 1;
            counter!("cache_misses_total").increment(1);
            return None;
        }

        match inner.entries.get_mut(&key) {
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(&key);
                inner.expirations += 1;
                inner.misses += 1;
                counter!("cache_misses_total").increment(1);
                None
            }
            Some(entry) => {
                entry.hits += 1;
                entry.last_accessed = now;
                let result = entry.result.clone();
                inner.hits += 1;
                counter!("cache_hits_total").increment(1);
                Some(result)
            }
            None => {
                inner.misses += 1;
                counter!("cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Store a fused result, evicting the least-recently-accessed
    /// entry first when at capacity. No-op while disabled.
    pub fn set(&self, indicator: &Indicator, result: FusedResult) {
        let key = indicator.cache_key();
        let now = Utc::now();
        let mut inner = self.inner.write();

        if !inner.config.enabled {
            return;
        }

        if !inner.entries.contains_key(&key) && inner.entries.len() >= inner.config.max_entries
        {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                counter!("cache_evictions_total").increment(1);
            }
        }

        let ttl = TimeDelta::seconds(inner.config.ttl_secs as i64);
        inner.entries.insert(
            key,
            CacheEntry {
                result,
                created_at: now,
                expires_at: now + ttl,
                hits: 0,
                last_accessed: now,
            },
        );
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate(&self, indicator: &Indicator) -> bool {
        self.inner
            .write()
            .entries
            .remove(&indicator.cache_key())
            .is_some()
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Start the background sweep ticker. Stops any previous ticker;
    /// the task is aborted when the cache is dropped.
    pub fn start_sweeper(&self) {
        let inner = Arc::clone(&self.inner);
        let interval_secs = inner.read().config.sweep_interval_secs.max(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut guard = inner.write();
                let before = guard.entries.len();
                guard.entries.retain(|_, e| !e.is_expired(now));
                let removed = before - guard.entries.len();
                guard.expirations += removed as u64;
                drop(guard);
                if removed > 0 {
                    tracing::debug!(removed, "Cache sweep removed expired entries");
                }
            }
        });
        if let Some(old) = self.sweeper.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.read().config.clone()
    }

    /// Replace the configuration. Disabling keeps stored entries and
    /// settings; re-enabling restores normal operation.
    pub fn update_config(&self, config: CacheConfig) {
        self.inner.write().config = config;
    }

    /// Serialize all non-expired entries for warm-starting
    pub fn export(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect()
    }

    /// Load previously exported entries, skipping any already expired
    pub fn import(&self, entries: Vec<CacheEntry>) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let mut loaded = 0;
        for entry in entries {
            if entry.is_expired(now) {
                continue;
            }
            let key = entry.result.indicator.cache_key();
            inner.entries.insert(key, entry);
            loaded += 1;
        }
        loaded
    }
}

impl Drop for EnrichmentCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AggregationMeta, Consensus, FusedMetadata, Verdict,
    };
    use std::collections::HashMap as Map;

    fn fused(value: &str) -> FusedResult {
        let indicator = Indicator::new(value, IocType::Ip);
        FusedResult {
            id: uuid::Uuid::new_v4(),
            indicator,
            consensus: Consensus {
                score: 50.0,
                verdict: Verdict::Suspicious,
                confidence: 0.5,
                distribution: Map::new(),
                agreement: 1.0,
                provider_count: 1,
            },
            metadata: FusedMetadata::default(),
            related_indicators: vec![],
            tags: vec![],
            provider_results: vec![],
            aggregation: AggregationMeta {
                timestamp: Utc::now(),
                processing_time_ms: 1,
                providers_used: 1,
                providers_succeeded: 1,
                providers_failed: 0,
                conflicts_resolved: 0,
            },
        }
    }

    fn cache(max: usize, ttl: u64) -> EnrichmentCache {
        EnrichmentCache::new(CacheConfig {
            enabled: true,
            ttl_secs: ttl,
            max_entries: max,
            sweep_interval_secs: 300,
        })
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = cache(10, 60);
        let indicator = Indicator::new("1.2.3.4", IocType::Ip);
        cache.set(&indicator, fused("1.2.3.4"));
        let hit = cache.get(&indicator).unwrap();
        assert_eq!(hit.indicator, indicator);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn keys_normalize_case_and_whitespace() {
        let cache = cache(10, 60);
        cache.set(&Indicator::new("Evil.COM", IocType::Domain), fused("x"));
        assert!(cache.get(&Indicator::new("  evil.com ", IocType::Domain)).is_some());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = cache(10, 0); // ttl 0: expires immediately
        let indicator = Indicator::new("1.2.3.4", IocType::Ip);
        cache.set(&indicator, fused("1.2.3.4"));
        assert!(cache.get(&indicator).is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let cache = cache(2, 60);
        let a = Indicator::new("1.1.1.1", IocType::Ip);
        let b = Indicator::new("2.2.2.2", IocType::Ip);
        let c = Indicator::new("3.3.3.3", IocType::Ip);
        cache.set(&a, fused("1.1.1.1"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.set(&b, fused("2.2.2.2"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Touch `a` so `b` becomes the LRU entry
        assert!(cache.get(&a).is_some());
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.set(&c, fused("3.3.3.3"));

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn disabled_cache_misses_and_ignores_set() {
        let cache = cache(10, 60);
        let indicator = Indicator::new("1.2.3.4", IocType::Ip);
        cache.set(&indicator, fused("1.2.3.4"));

        let mut cfg = cache.config();
        cfg.enabled = false;
        cache.update_config(cfg);

        assert!(cache.get(&indicator).is_none());
        cache.set(&Indicator::new("5.6.7.8", IocType::Ip), fused("5.6.7.8"));

        // Re-enabling restores the previously stored entry
        let mut cfg = cache.config();
        cfg.enabled = true;
        cache.update_config(cfg);
        assert!(cache.get(&indicator).is_some());
        assert!(cache.get(&Indicator::new("5.6.7.8", IocType::Ip)).is_none());
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = cache(10, 0);
        cache.set(&Indicator::new("1.2.3.4", IocType::Ip), fused("1.2.3.4"));
        cache.set(&Indicator::new("5.6.7.8", IocType::Ip), fused("5.6.7.8"));
        assert_eq!(cache.sweep_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn export_import_round_trips_live_entries() {
        let source = cache(10, 60);
        source.set(&Indicator::new("1.2.3.4", IocType::Ip), fused("1.2.3.4"));
        source.set(&Indicator::new("5.6.7.8", IocType::Ip), fused("5.6.7.8"));

        let dump = source.export();
        assert_eq!(dump.len(), 2);

        let target = cache(10, 60);
        assert_eq!(target.import(dump), 2);
        assert!(target.get(&Indicator::new("1.2.3.4", IocType::Ip)).is_some());
    }

    #[test]
    fn import_skips_already_expired_entries() {
        let target = cache(10, 60);
        let now = Utc::now();
        let stale = CacheEntry {
            result: fused("1.2.3.4"),
            created_at: now - TimeDelta::hours(2),
            expires_at: now - TimeDelta::hours(1),
            hits: 3,
            last_accessed: now - TimeDelta::hours(1),
        };
        let live = CacheEntry {
            result: fused("5.6.7.8"),
            created_at: now,
            expires_at: now + TimeDelta::hours(1),
            hits: 0,
            last_accessed: now,
        };
        assert_eq!(target.import(vec![stale, live]), 1);
        assert!(target.get(&Indicator::new("1.2.3.4", IocType::Ip)).is_none());
        assert!(target.get(&Indicator::new("5.6.7.8", IocType::Ip)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_in_background() {
        let cache = EnrichmentCache::new(CacheConfig {
            enabled: true,
            ttl_secs: 0,
            max_entries: 10,
            sweep_interval_secs: 1,
        });
        cache.set(&Indicator::new("1.2.3.4", IocType::Ip), fused("1.2.3.4"));
        cache.start_sweeper();
        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(cache.is_empty());
        cache.stop_sweeper();
    }
}
