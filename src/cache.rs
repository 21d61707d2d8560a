//! C1 — namespaced TTL cache with single-flight loading and a per-system
//! id-list index, backed by `DashMap` and generalized to multiple
//! namespaces plus the single-flight `get_or_compute` path concurrent
//! enrichment needs.

use crate::clock::{Clock, SharedClock};
use crate::error::CacheError;
use crate::event_store::EventStore;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const LOADER_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct NamespaceStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl NamespaceStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    value: serde_json::Value,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

type LoaderBroadcast = broadcast::Sender<Result<serde_json::Value, CacheError>>;

pub struct Cache {
    clock: SharedClock,
    entries: DashMap<String, Slot>,
    inflight: DashMap<String, LoaderBroadcast>,
    events: Arc<EventStore>,
    counters: DashMap<&'static str, Arc<Counters>>,
}

fn ns_key(ns: &str, key: &str) -> String {
    format!("{ns}:{key}")
}

impl Cache {
    pub fn new(clock: SharedClock, events: Arc<EventStore>) -> Self {
        Cache {
            clock,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            events,
            counters: DashMap::new(),
        }
    }

    fn counters_for(&self, ns: &'static str) -> Arc<Counters> {
        self.counters
            .entry(ns)
            .or_insert_with(|| Arc::new(Counters::default()))
            .clone()
    }

    /// Entries past expiry are observationally absent even before the lazy
    /// sweep runs.
    pub fn get<V: DeserializeOwned>(&self, ns: &'static str, key: &str) -> Option<V> {
        let counters = self.counters_for(ns);
        let full_key = ns_key(ns, key);
        let now = self.clock.now_ms();
        match self.entries.get(&full_key) {
            Some(slot) if slot.expires_at_ms > now => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                serde_json::from_value(slot.value.clone()).ok()
            }
            Some(_) => {
                drop(self.entries.remove(&full_key));
                counters.misses.fetch_add(1, Ordering::Relaxed);
                counters.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put<V: Serialize>(&self, ns: &'static str, key: &str, value: &V, ttl: Duration) {
        let full_key = ns_key(ns, key);
        let expires_at_ms = self.clock.now_ms() + ttl.as_millis() as i64;
        match serde_json::to_value(value) {
            Ok(value) => {
                self.entries.insert(full_key, Slot { value, expires_at_ms });
            }
            Err(e) => warn!("cache: failed to serialize value for {full_key}: {e}"),
        }
    }

    /// Single-flight: concurrent callers for the same key block on one
    /// loader. The leader broadcasts its result to every follower; a leader
    /// that never finishes within `LOADER_TIMEOUT_MS` fails every waiter with
    /// `cache:loader_timeout`.
    pub async fn get_or_compute<V, F, Fut>(
        &self,
        ns: &'static str,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<V, CacheError>
    where
        V: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>>,
    {
        if let Some(v) = self.get::<V>(ns, key) {
            return Ok(v);
        }

        let full_key = ns_key(ns, key);

        // Try to become the leader by inserting a fresh broadcast channel.
        let (became_leader, rx_or_tx) = {
            let mut became_leader = false;
            let entry = self.inflight.entry(full_key.clone()).or_insert_with(|| {
                became_leader = true;
                broadcast::channel(1).0
            });
            (became_leader, entry.clone())
        };

        if became_leader {
            let result = loader().await;
            if let Ok(v) = &result {
                self.put(ns, key, v, ttl);
            }
            self.inflight.remove(&full_key);
            let broadcast_result: Result<serde_json::Value, CacheError> = match &result {
                Ok(v) => serde_json::to_value(v).map_err(|_| CacheError::WriteFailed),
                Err(e) => Err(e.clone()),
            };
            let _ = rx_or_tx.send(broadcast_result);
            result
        } else {
            let mut rx = rx_or_tx.subscribe();
            match tokio::time::timeout(Duration::from_millis(LOADER_TIMEOUT_MS), rx.recv()).await {
                Ok(Ok(Ok(value))) => {
                    serde_json::from_value(value).map_err(|_| CacheError::WriteFailed)
                }
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => {
                    // Leader dropped the sender without a send; retry as if we raced a
                    // stalled leader that was abandoned.
                    Err(CacheError::LoaderTimeout)
                }
                Err(_) => Err(CacheError::LoaderTimeout),
            }
        }
    }

    /// Delegates to the EventStore (C2), which owns ring capacity and GC.
    pub fn list_system_killmails(&self, system_id: u32, limit: usize) -> Vec<i64> {
        self.events.list(system_id, limit)
    }

    pub fn add_system_killmail(&self, system_id: u32, killmail_id: i64) {
        self.events.append(system_id, killmail_id);
    }

    /// Monotonic per-system kill counter, for `KillmailCount` broadcasts.
    pub fn increment_system_count(&self, system_id: u32) -> u64 {
        self.events.increment_count(system_id)
    }

    pub fn system_kill_count(&self, system_id: u32) -> u64 {
        self.events.get_count(system_id)
    }

    pub fn purge(&self, ns: &str) {
        let prefix = format!("{ns}:");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn purge_all(&self) {
        self.entries.clear();
        self.inflight.clear();
    }

    pub fn stats(&self, ns: &'static str) -> NamespaceStats {
        let prefix = format!("{ns}:");
        let size = self.entries.iter().filter(|e| e.key().starts_with(&prefix)).count();
        let counters = self.counters_for(ns);
        NamespaceStats {
            size,
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Lazy sweep: drop all entries past expiry. Called periodically by a
    /// background task; `get` also self-heals on read.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let mut evicted_per_ns: std::collections::HashMap<String, u64> = Default::default();
        self.entries.retain(|k, slot| {
            let keep = slot.expires_at_ms > now;
            if !keep {
                if let Some((ns, _)) = k.split_once(':') {
                    *evicted_per_ns.entry(ns.to_string()).or_default() += 1;
                }
            }
            keep
        });
        for (ns, count) in evicted_per_ns {
            if let Some(counters) = self.counters.get(ns.as_str()) {
                counters.evictions.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}

pub const NS_KILLMAIL: &str = "killmail";
pub const NS_SYSTEM_KILLMAILS: &str = "system_killmails";
pub const NS_ESI_CHARACTER: &str = "esi_character";
pub const NS_ESI_CORPORATION: &str = "esi_corporation";
pub const NS_ESI_ALLIANCE: &str = "esi_alliance";
pub const NS_ESI_TYPE: &str = "esi_type";
pub const NS_ESI_GROUP: &str = "esi_group";
pub const NS_ESI_KILLMAIL: &str = "esi_killmail";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::atomic::AtomicU32;

    fn cache_with_clock() -> (Cache, FakeClock) {
        let clock = Arc::new(FakeClock::new(0));
        let events = Arc::new(EventStore::new(clock.clone(), 10_000));
        (Cache::new(clock.clone(), events), (*clock).clone())
    }

    #[test]
    fn put_then_get_within_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put("killmail", "1", &42i64, Duration::from_secs(10));
        assert_eq!(cache.get::<i64>("killmail", "1"), Some(42));
        clock.advance_secs(9);
        assert_eq!(cache.get::<i64>("killmail", "1"), Some(42));
    }

    #[test]
    fn get_misses_strictly_after_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put("killmail", "1", &42i64, Duration::from_secs(10));
        clock.advance_secs(11);
        assert_eq!(cache.get::<i64>("killmail", "1"), None);
    }

    #[tokio::test]
    async fn get_or_compute_runs_loader_once_for_n_concurrent_callers() {
        let (cache, _clock) = cache_with_clock();
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("esi_character", "42", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, CacheError>("Some Character".to_string())
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == "Some Character"));
    }

    #[test]
    fn system_killmail_ring_is_bounded_and_newest_first() {
        let clock = Arc::new(FakeClock::new(0));
        let events = Arc::new(EventStore::new(clock.clone(), 3));
        let cache = Cache::new(clock, events);
        for i in 0..5 {
            cache.add_system_killmail(30000142, i);
        }
        assert_eq!(cache.list_system_killmails(30000142, 10), vec![4, 3, 2]);
    }
}
