//! C12 — inverted indices for O(1) subscription-to-killmail matching.
//! `SystemIndex` and `CharacterIndex` share the same id -> subscription-set
//! shape; kept as two distinct types (rather than one generic over id type)
//! since systems and characters need separate sweep/size reporting.

use dashmap::DashMap;
use std::collections::HashSet;

pub type SubscriptionId = String;

/// One direction of the inverted index: entity id -> the subscriptions
/// that want it. `find`/`find_many` are the hot path called once per
/// killmail; both avoid allocating beyond the returned set.
struct InvertedIndex<K: std::hash::Hash + Eq + Copy> {
    by_id: DashMap<K, HashSet<SubscriptionId>>,
    by_subscription: DashMap<SubscriptionId, HashSet<K>>,
}

impl<K: std::hash::Hash + Eq + Copy> Default for InvertedIndex<K> {
    fn default() -> Self {
        InvertedIndex {
            by_id: DashMap::new(),
            by_subscription: DashMap::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Copy> InvertedIndex<K> {
    fn add(&self, subscription_id: &str, ids: &[K]) {
        for &id in ids {
            self.by_id.entry(id).or_default().insert(subscription_id.to_string());
        }
        self.by_subscription
            .entry(subscription_id.to_string())
            .or_default()
            .extend(ids.iter().copied());
    }

    /// Replaces a subscription's entire id set, removing stale entries
    /// under ids no longer present.
    fn update(&self, subscription_id: &str, ids: &[K]) {
        self.remove(subscription_id);
        self.add(subscription_id, ids);
    }

    fn remove(&self, subscription_id: &str) {
        if let Some((_, old_ids)) = self.by_subscription.remove(subscription_id) {
            for id in old_ids {
                if let Some(mut subs) = self.by_id.get_mut(&id) {
                    subs.remove(subscription_id);
                }
            }
        }
    }

    fn find(&self, id: K) -> HashSet<SubscriptionId> {
        self.by_id.get(&id).map(|s| s.clone()).unwrap_or_default()
    }

    fn find_many(&self, ids: &[K]) -> HashSet<SubscriptionId> {
        let mut result = HashSet::new();
        for &id in ids {
            if let Some(subs) = self.by_id.get(&id) {
                result.extend(subs.iter().cloned());
            }
        }
        result
    }

    /// Drops any id bucket whose subscriber set became empty, reclaiming
    /// memory after a wave of removals.
    fn sweep(&self) -> usize {
        let before = self.by_id.len();
        self.by_id.retain(|_, subs| !subs.is_empty());
        before - self.by_id.len()
    }

    fn id_count(&self) -> usize {
        self.by_id.len()
    }
}

#[derive(Default)]
pub struct SystemIndex(InvertedIndex<u32>);

impl SystemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription_id: &str, system_ids: &[u32]) {
        self.0.add(subscription_id, system_ids);
    }

    pub fn update(&self, subscription_id: &str, system_ids: &[u32]) {
        self.0.update(subscription_id, system_ids);
    }

    pub fn remove(&self, subscription_id: &str) {
        self.0.remove(subscription_id);
    }

    pub fn find(&self, system_id: u32) -> HashSet<SubscriptionId> {
        self.0.find(system_id)
    }

    pub fn sweep(&self) -> usize {
        self.0.sweep()
    }

    pub fn system_count(&self) -> usize {
        self.0.id_count()
    }
}

#[derive(Default)]
pub struct CharacterIndex(InvertedIndex<u64>);

impl CharacterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription_id: &str, character_ids: &[u64]) {
        self.0.add(subscription_id, character_ids);
    }

    pub fn update(&self, subscription_id: &str, character_ids: &[u64]) {
        self.0.update(subscription_id, character_ids);
    }

    pub fn remove(&self, subscription_id: &str) {
        self.0.remove(subscription_id);
    }

    pub fn find_many(&self, character_ids: &[u64]) -> HashSet<SubscriptionId> {
        self.0.find_many(character_ids)
    }

    pub fn sweep(&self) -> usize {
        self.0.sweep()
    }

    pub fn character_count(&self) -> usize {
        self.0.id_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_returns_every_subscription_watching_a_system() {
        let index = SystemIndex::new();
        index.add("sub-a", &[30000142, 30000144]);
        index.add("sub-b", &[30000142]);

        let matches = index.find(30000142);
        assert_eq!(matches.len(), 2);
        assert!(matches.contains("sub-a"));
        assert!(matches.contains("sub-b"));
        assert!(index.find(30000144).contains("sub-a"));
    }

    #[test]
    fn update_drops_stale_ids_and_keeps_fresh_ones() {
        let index = SystemIndex::new();
        index.add("sub-a", &[1, 2, 3]);
        index.update("sub-a", &[2, 4]);

        assert!(index.find(1).is_empty());
        assert!(index.find(2).contains("sub-a"));
        assert!(index.find(4).contains("sub-a"));
    }

    #[test]
    fn remove_clears_subscription_from_every_id_bucket() {
        let index = CharacterIndex::new();
        index.add("sub-a", &[1, 2]);
        index.remove("sub-a");
        assert!(index.find_many(&[1, 2]).is_empty());
    }

    #[test]
    fn sweep_reclaims_empty_id_buckets() {
        let index = SystemIndex::new();
        index.add("sub-a", &[1]);
        index.remove("sub-a");
        assert_eq!(index.sweep(), 1);
        assert_eq!(index.system_count(), 0);
    }
}
