//! C8 — fills in names/ship metadata on an already-normalized `Killmail` by
//! resolving every distinct character/corporation/alliance/ship-type/
//! weapon-type id through the ESI resolver (C6), via its batch helpers.
//! Small killmails resolve sequentially; killmails with enough attackers to
//! make the round trips worth parallelizing raise the concurrency passed
//! into those batches.

use crate::esi::EsiResolver;
use crate::error::EnrichError;
use crate::models::Killmail;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Enricher {
    esi: Arc<EsiResolver>,
    ship_categories: HashMap<u32, &'static str>,
    max_concurrency: usize,
    min_attackers_for_parallel: usize,
    task_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    Full,
    Partial,
}

impl Enricher {
    pub fn new(
        esi: Arc<EsiResolver>,
        max_concurrency: usize,
        min_attackers_for_parallel: usize,
        task_timeout: Duration,
    ) -> Self {
        Enricher {
            esi,
            ship_categories: crate::esi::bootstrap_ship_categories(),
            max_concurrency,
            min_attackers_for_parallel,
            task_timeout,
        }
    }

    /// Resolves every distinct character/corporation/alliance/ship-type id
    /// referenced by `killmail` and writes the results back onto its
    /// participants. A failed lookup for one id never blocks the others
    /// — the killmail is still delivered with
    /// whatever names resolved, and the outcome tells the caller whether
    /// anything was missing.
    pub async fn enrich(&self, killmail: &mut Killmail) -> EnrichOutcome {
        let character_ids: Vec<u64> = dedup(killmail.participants().filter_map(|p| p.character_id));
        let corporation_ids: Vec<u64> = dedup(killmail.participants().filter_map(|p| p.corporation_id));
        let alliance_ids: Vec<u64> = dedup(killmail.participants().filter_map(|p| p.alliance_id));
        let ship_type_ids: Vec<u32> = dedup(killmail.participants().map(|p| p.ship_type_id));
        let weapon_type_ids: Vec<u32> = dedup(killmail.participants().filter_map(|p| p.weapon_type_id));
        let item_type_ids: Vec<u32> = dedup(ship_type_ids.iter().copied().chain(weapon_type_ids.iter().copied()));

        let parallel = killmail.attackers.len() >= self.min_attackers_for_parallel;
        let concurrency = if parallel { self.max_concurrency } else { 1 };

        let (characters, corporations, alliances, item_types) = tokio::join!(
            self.resolve_characters(&character_ids, concurrency),
            self.resolve_corporations(&corporation_ids, concurrency),
            self.resolve_alliances(&alliance_ids, concurrency),
            self.resolve_item_types(&item_type_ids, concurrency),
        );

        let mut any_missing = characters.1 || corporations.1 || alliances.1 || item_types.1;

        for participant in killmail.participants_mut() {
            if let Some(id) = participant.character_id {
                if let Some(c) = characters.0.get(&id) {
                    participant.character_name = Some(c.name.clone());
                } else {
                    any_missing = true;
                }
            }
            if let Some(id) = participant.corporation_id {
                if let Some(c) = corporations.0.get(&id) {
                    participant.corporation_name = Some(c.name.clone());
                }
            }
            if let Some(id) = participant.alliance_id {
                if let Some(a) = alliances.0.get(&id) {
                    participant.alliance_name = Some(a.name.clone());
                }
            }
            if let Some(t) = item_types.0.get(&participant.ship_type_id) {
                participant.ship_name = Some(t.name.clone());
                participant.ship_group = Some(t.group_id);
                participant.ship_category = self.ship_categories.get(&t.group_id).map(|s| s.to_string());
            }
            if let Some(weapon_id) = participant.weapon_type_id {
                if let Some(t) = item_types.0.get(&weapon_id) {
                    participant.weapon_name = Some(t.name.clone());
                }
            }
        }

        if any_missing {
            EnrichOutcome::Partial
        } else {
            EnrichOutcome::Full
        }
    }

    async fn resolve_characters(&self, ids: &[u64], concurrency: usize) -> (HashMap<u64, crate::esi::EsiCharacter>, bool) {
        let results = self.run_with_timeout(self.esi.characters_batch(ids, concurrency)).await;
        collect_ok(results)
    }

    async fn resolve_corporations(&self, ids: &[u64], concurrency: usize) -> (HashMap<u64, crate::esi::EsiCorporation>, bool) {
        let results = self.run_with_timeout(stream::iter(ids.iter().copied())
            .map(|id| async move { (id, self.esi.corporation(id).await) })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>())
            .await;
        collect_ok(results)
    }

    async fn resolve_alliances(&self, ids: &[u64], concurrency: usize) -> (HashMap<u64, crate::esi::EsiAlliance>, bool) {
        let results = self.run_with_timeout(stream::iter(ids.iter().copied())
            .map(|id| async move { (id, self.esi.alliance(id).await) })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>())
            .await;
        collect_ok(results)
    }

    /// Resolves both ship and weapon type ids through the same ESI "type"
    /// lookup and batch helper — they share one namespace.
    async fn resolve_item_types(&self, ids: &[u32], concurrency: usize) -> (HashMap<u32, crate::esi::EsiType>, bool) {
        let results = self.run_with_timeout(self.esi.ship_types_batch(ids, concurrency)).await;
        collect_ok(results)
    }

    async fn run_with_timeout<T>(&self, fut: impl std::future::Future<Output = T>) -> Option<T> {
        match tokio::time::timeout(self.task_timeout, fut).await {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("enricher: resolution batch exceeded task timeout, treating as partial");
                None
            }
        }
    }
}

fn dedup<T: std::hash::Hash + Eq + Copy>(iter: impl Iterator<Item = T>) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    iter.filter(|id| seen.insert(*id)).collect()
}

fn collect_ok<K, V, E>(results: Option<Vec<(K, Result<V, E>)>>) -> (HashMap<K, V>, bool)
where
    K: std::hash::Hash + Eq,
{
    match results {
        Some(results) => {
            let mut missing = false;
            let mut map = HashMap::new();
            for (id, result) in results {
                match result {
                    Ok(v) => {
                        map.insert(id, v);
                    }
                    Err(_) => missing = true,
                }
            }
            (map, missing)
        }
        None => (HashMap::new(), true),
    }
}

impl From<EnrichOutcome> for Result<(), EnrichError> {
    fn from(outcome: EnrichOutcome) -> Self {
        match outcome {
            EnrichOutcome::Full => Ok(()),
            EnrichOutcome::Partial => Err(EnrichError::Partial),
        }
    }
}
