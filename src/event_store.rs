//! C2 — bounded per-system ring of killmail ids with periodic GC, plus a
//! monotonic per-system kill counter kept separately from the ring (which is
//! capped and therefore not a valid count on its own). Cache (C1) delegates
//! `list_system_killmails`/`add_system_killmail` here; EventStore is what
//! actually owns ring capacity and the GC sweep.

use crate::clock::SharedClock;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

struct SystemRing {
    ids: VecDeque<i64>,
    last_append_ms: i64,
}

pub struct EventStore {
    clock: SharedClock,
    max_events_per_system: usize,
    rings: DashMap<u32, SystemRing>,
    counts: DashMap<u32, AtomicU64>,
}

impl EventStore {
    pub fn new(clock: SharedClock, max_events_per_system: usize) -> Self {
        EventStore {
            clock,
            max_events_per_system,
            rings: DashMap::new(),
            counts: DashMap::new(),
        }
    }

    /// Monotonic per-system kill counter, distinct from the ring's
    /// (capped) length — never shrinks even once the ring starts evicting.
    pub fn increment_count(&self, system_id: u32) -> u64 {
        self.counts
            .entry(system_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn get_count(&self, system_id: u32) -> u64 {
        self.counts.get(&system_id).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Prepends newest-first; oldest entries are evicted once the ring
    /// exceeds `max_events_per_system`.
    pub fn append(&self, system_id: u32, killmail_id: i64) {
        let now = self.clock.now_ms();
        let mut ring = self.rings.entry(system_id).or_insert_with(|| SystemRing {
            ids: VecDeque::new(),
            last_append_ms: now,
        });
        ring.ids.push_front(killmail_id);
        ring.last_append_ms = now;
        while ring.ids.len() > self.max_events_per_system {
            ring.ids.pop_back();
        }
    }

    pub fn list(&self, system_id: u32, limit: usize) -> Vec<i64> {
        self.rings
            .get(&system_id)
            .map(|r| r.ids.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, system_id: u32) -> usize {
        self.rings.get(&system_id).map(|r| r.ids.len()).unwrap_or(0)
    }

    /// Reclaims systems with no appends in the last `2 * ttl`. Returns
    /// the number of systems reclaimed, for observability.
    pub fn gc(&self, ttl_ms: i64) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now - 2 * ttl_ms;
        let before = self.rings.len();
        self.rings.retain(|_, ring| ring.last_append_ms > cutoff);
        before - self.rings.len()
    }

    pub fn system_count(&self) -> usize {
        self.rings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::Arc;

    #[test]
    fn ring_is_capped_and_newest_first() {
        let clock = Arc::new(FakeClock::new(0));
        let store = EventStore::new(clock, 3);
        for i in 0..10 {
            store.append(30000142, i);
        }
        assert_eq!(store.count(30000142), 3);
        assert_eq!(store.list(30000142, 10), vec![9, 8, 7]);
    }

    #[test]
    fn gc_reclaims_stale_systems() {
        let clock = Arc::new(FakeClock::new(0));
        let store = EventStore::new(clock.clone(), 100);
        store.append(1, 10);
        clock.advance_secs(1000);
        store.append(2, 20);

        let reclaimed = store.gc(60_000); // 2*ttl window of 120s
        assert_eq!(reclaimed, 1);
        assert_eq!(store.count(1), 0);
        assert_eq!(store.count(2), 1);
    }
}
