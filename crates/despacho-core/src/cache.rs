use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;

/// Knobs for the TTL scan and capacity compaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries older than this are removed by the TTL scan.
    pub entry_ttl_ms: u64,
    /// A TTL scan runs at most once per this interval.
    pub scan_interval_ms: u64,
    /// Compaction triggers once the entry count reaches this limit.
    pub entry_limit: usize,
    /// Compaction target as a fraction of the current count. The oldest
    /// entries are removed until the count is at or below the target.
    pub compaction_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl_ms: 300_000,
            scan_interval_ms: 600_000,
            entry_limit: 2048,
            compaction_ratio: 0.8,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    write_time: Instant,
}

enum ReclaimKind {
    TtlScan,
    Compaction,
}

/// TTL- and capacity-bounded key/value store with background reclamation.
/// Backs the in-memory outbox, inbox, and archive stores.
///
/// Reclamation never blocks the hot path: both the TTL scan and capacity
/// compaction run on a spawned thread behind a single try-lock. A busy
/// reclaimer means the triggering operation simply skips — the next
/// operation re-triggers it. The count limit is therefore eventual, not
/// strict: a transient overshoot above `entry_limit` is expected while a
/// compaction pass is in flight.
pub struct EvictionCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for EvictionCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    /// Single try-lock shared by the TTL scan and compaction so the two
    /// reclamation paths never process the same entries twice.
    reclaiming: AtomicBool,
    last_scan: Mutex<Instant>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<K, V> EvictionCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&config.compaction_ratio) {
            return Err(ConfigError::InvalidCompactionRatio(config.compaction_ratio));
        }
        let now = clock.now();
        Ok(Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                reclaiming: AtomicBool::new(false),
                last_scan: Mutex::new(now),
                config,
                clock,
            }),
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let write_time = self.inner.clock.now();
        let count = {
            let mut entries = self.inner.lock_entries();
            entries.insert(key, CacheEntry { value, write_time });
            entries.len()
        };
        self.maybe_reclaim(count);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (value, count) = {
            let entries = self.inner.lock_entries();
            (
                entries.get(key).map(|entry| entry.value.clone()),
                entries.len(),
            )
        };
        self.maybe_reclaim(count);
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let (value, count) = {
            let mut entries = self.inner.lock_entries();
            (entries.remove(key).map(|entry| entry.value), entries.len())
        };
        self.maybe_reclaim(count);
        value
    }

    /// Mutate a value in place without refreshing its write time. Returns
    /// false when the key is absent.
    pub fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let mut entries = self.inner.lock_entries();
        match entries.get_mut(key) {
            Some(entry) => {
                f(&mut entry.value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_entries().is_empty()
    }

    /// Point-in-time snapshot of every entry and its write time.
    pub fn snapshot(&self) -> Vec<(K, V, Instant)> {
        let entries = self.inner.lock_entries();
        entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.write_time))
            .collect()
    }

    /// Decide whether this operation should kick off background
    /// reclamation. Compaction wins over the TTL scan when both are due.
    fn maybe_reclaim(&self, count: usize) {
        if count >= self.inner.config.entry_limit {
            self.spawn_reclaim(ReclaimKind::Compaction);
            return;
        }
        let scan_interval = Duration::from_millis(self.inner.config.scan_interval_ms);
        let due = {
            let last_scan = self
                .inner
                .last_scan
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.clock.now().duration_since(*last_scan) >= scan_interval
        };
        if due {
            self.spawn_reclaim(ReclaimKind::TtlScan);
        }
    }

    fn spawn_reclaim(&self, kind: ReclaimKind) {
        // Skip-if-busy: overlapping reclaims are dropped, never queued, so
        // the caller that triggered this is back on its way immediately.
        if self
            .inner
            .reclaiming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("despacho-cache-reclaim".to_string())
            .spawn(move || {
                match kind {
                    ReclaimKind::TtlScan => inner.run_ttl_scan(),
                    ReclaimKind::Compaction => inner.run_compaction(),
                }
                inner.reclaiming.store(false, Ordering::Release);
            });
        if let Err(e) = spawned {
            self.inner.reclaiming.store(false, Ordering::Release);
            warn!(error = %e, "failed to spawn cache reclaim, skipping this cycle");
        }
    }

    /// Run the TTL scan synchronously. Test hook.
    #[cfg(test)]
    pub(crate) fn run_ttl_scan_now(&self) {
        self.inner.run_ttl_scan();
    }

    /// Run capacity compaction synchronously. Test hook.
    #[cfg(test)]
    pub(crate) fn run_compaction_now(&self) {
        self.inner.run_compaction();
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every entry whose age has reached the TTL. Keys are collected
    /// under one short lock and removed under another, re-checking the
    /// write time so an entry rewritten in between survives. Entries
    /// removed by a third party in between are simply skipped.
    fn run_ttl_scan(&self) {
        let now = self.clock.now();
        {
            let mut last_scan = self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
            *last_scan = now;
        }
        let ttl = Duration::from_millis(self.config.entry_ttl_ms);

        let expired: Vec<(K, Instant)> = {
            let entries = self.lock_entries();
            entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.write_time) >= ttl)
                .map(|(key, entry)| (key.clone(), entry.write_time))
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut removed = 0usize;
        for (key, seen_write_time) in expired {
            let mut entries = self.lock_entries();
            if entries
                .get(&key)
                .is_some_and(|entry| entry.write_time == seen_write_time)
            {
                entries.remove(&key);
                removed += 1;
            }
        }
        debug!(removed, "ttl scan evicted entries");
    }

    /// Remove the oldest entries until the count is at or below
    /// `count * compaction_ratio`.
    fn run_compaction(&self) {
        let mut by_age: Vec<(K, Instant)> = {
            let entries = self.lock_entries();
            if entries.len() < self.config.entry_limit {
                return;
            }
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.write_time))
                .collect()
        };

        let count = by_age.len();
        let target = (count as f64 * self.config.compaction_ratio) as usize;
        by_age.sort_by_key(|(_, write_time)| *write_time);

        let mut removed = 0usize;
        for (key, seen_write_time) in by_age.into_iter().take(count.saturating_sub(target)) {
            let mut entries = self.lock_entries();
            if entries
                .get(&key)
                .is_some_and(|entry| entry.write_time == seen_write_time)
            {
                entries.remove(&key);
                removed += 1;
            }
        }
        debug!(before = count, removed, target, "compaction removed oldest entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_cache(config: CacheConfig, clock: Arc<ManualClock>) -> EvictionCache<String, u32> {
        EvictionCache::with_clock(config, clock).unwrap()
    }

    #[test]
    fn rejects_out_of_range_compaction_ratio() {
        let config = CacheConfig {
            compaction_ratio: 1.5,
            ..CacheConfig::default()
        };
        assert!(matches!(
            EvictionCache::<String, u32>::new(config),
            Err(ConfigError::InvalidCompactionRatio(_))
        ));
    }

    #[test]
    fn entry_present_before_ttl_and_absent_after_scan() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_ttl_ms: 5_000,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        cache.insert("a".to_string(), 1);

        // Strictly before the TTL: present, even after a scan
        clock.advance(Duration::from_millis(4_999));
        cache.run_ttl_scan_now();
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        // At/after the TTL: a scan removes it
        clock.advance(Duration::from_millis(2));
        cache.run_ttl_scan_now();
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn ttl_scan_spares_rewritten_entries() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_ttl_ms: 5_000,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        cache.insert("a".to_string(), 1);
        clock.advance(Duration::from_millis(4_000));
        // Rewrite refreshes the write time
        cache.insert("a".to_string(), 2);
        clock.advance(Duration::from_millis(2_000));

        cache.run_ttl_scan_now();
        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn compaction_bounds_count_and_keeps_newest() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_limit: 10,
            compaction_ratio: 0.5,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        for i in 0..10u32 {
            cache.insert(format!("k{i}"), i);
            clock.advance(Duration::from_millis(1));
        }
        assert_eq!(cache.len(), 10);

        cache.run_compaction_now();
        assert_eq!(cache.len(), 5);

        // The oldest half is gone, the newest half survives
        for i in 0..5u32 {
            assert_eq!(cache.get(&format!("k{i}")), None);
        }
        for i in 5..10u32 {
            assert_eq!(cache.get(&format!("k{i}")), Some(i));
        }
    }

    #[test]
    fn compaction_is_a_noop_below_the_limit() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_limit: 100,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        cache.insert("a".to_string(), 1);
        cache.run_compaction_now();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn background_compaction_eventually_bounds_count() {
        // Exercise the real spawn path: insert past the limit and wait for
        // the background pass to bring the count down.
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_limit: 32,
            compaction_ratio: 0.5,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        for i in 0..40u32 {
            cache.insert(format!("k{i}"), i);
            clock.advance(Duration::from_millis(1));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.len() > 32 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.len() <= 32, "count still {} after compaction", cache.len());
    }

    #[test]
    fn update_mutates_without_refreshing_write_time() {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            entry_ttl_ms: 5_000,
            ..CacheConfig::default()
        };
        let cache = test_cache(config, Arc::clone(&clock));

        cache.insert("a".to_string(), 1);
        clock.advance(Duration::from_millis(4_000));
        assert!(cache.update(&"a".to_string(), |v| *v = 9));
        assert_eq!(cache.get(&"a".to_string()), Some(9));

        // The update did not reset the TTL clock
        clock.advance(Duration::from_millis(2_000));
        cache.run_ttl_scan_now();
        assert_eq!(cache.get(&"a".to_string()), None);

        assert!(!cache.update(&"a".to_string(), |v| *v = 3));
    }

    #[test]
    fn snapshot_reflects_point_in_time_contents() {
        let clock = Arc::new(ManualClock::new());
        let cache = test_cache(CacheConfig::default(), clock);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        let snapshot = cache.snapshot();
        cache.remove(&"a".to_string());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(cache.len(), 1);
    }
}
