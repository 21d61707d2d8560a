//! C6 — ESI lookups, cached and batched. Uses the same base-URL-plus-path
//! request convention throughout, covering the full set of entity lookups
//! the enricher needs, each going through the cache so concurrent
//! enrichments of the same id share one upstream call.

use crate::cache::{self, Cache};
use crate::error::{EsiError, HttpError};
use crate::http_fetcher::HttpFetcher;
use crate::rate_limiter::Priority;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const ESI_BASE: &str = "https://esi.evetech.net/latest/";
const ESI_SERVICE: &str = "esi";

#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct EsiCharacter {
    pub name: String,
    pub corporation_id: u64,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub faction_id: Option<u64>,
    pub security_status: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct EsiCorporation {
    pub name: String,
    pub ticker: String,
    #[serde(default)]
    pub alliance_id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct EsiAlliance {
    pub name: String,
    pub ticker: String,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct EsiType {
    pub name: String,
    pub group_id: u32,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct EsiGroup {
    pub name: String,
    pub category_id: u32,
}

pub struct EsiResolver {
    fetcher: Arc<HttpFetcher>,
    cache: Arc<Cache>,
    ttl: Duration,
    killmail_ttl: Duration,
    queue_timeout_ms: u64,
    max_concurrency: usize,
}

impl EsiResolver {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        cache: Arc<Cache>,
        ttl: Duration,
        killmail_ttl: Duration,
        queue_timeout_ms: u64,
        max_concurrency: usize,
    ) -> Self {
        EsiResolver {
            fetcher,
            cache,
            ttl,
            killmail_ttl,
            queue_timeout_ms,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub async fn character(&self, id: u64) -> Result<EsiCharacter, EsiError> {
        self.resolve_entity(cache::NS_ESI_CHARACTER, id, &format!("characters/{id}/")).await
    }

    pub async fn corporation(&self, id: u64) -> Result<EsiCorporation, EsiError> {
        self.resolve_entity(cache::NS_ESI_CORPORATION, id, &format!("corporations/{id}/")).await
    }

    pub async fn alliance(&self, id: u64) -> Result<EsiAlliance, EsiError> {
        self.resolve_entity(cache::NS_ESI_ALLIANCE, id, &format!("alliances/{id}/")).await
    }

    pub async fn ship_type(&self, id: u32) -> Result<EsiType, EsiError> {
        self.resolve_entity(cache::NS_ESI_TYPE, id as u64, &format!("universe/types/{id}/")).await
    }

    /// Weapon types resolve through the same `universe/types` endpoint and
    /// cache namespace as ship types; the separate name just keeps call
    /// sites readable.
    pub async fn weapon_type(&self, id: u32) -> Result<EsiType, EsiError> {
        self.ship_type(id).await
    }

    pub async fn group(&self, id: u32) -> Result<EsiGroup, EsiError> {
        self.resolve_entity(cache::NS_ESI_GROUP, id as u64, &format!("universe/groups/{id}/")).await
    }

    /// Shared path for every cached single-entity lookup; maps the
    /// underlying HTTP status to the ESI error taxonomy.
    async fn resolve_entity<T>(&self, ns: &'static str, id: u64, path: &str) -> Result<T, EsiError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone,
    {
        if let Some(v) = self.cache.get::<T>(ns, &id.to_string()) {
            return Ok(v);
        }
        let url = format!("{ESI_BASE}{path}");
        let result = self
            .fetcher
            .get_json::<T>(ESI_SERVICE, Priority::Realtime, self.queue_timeout_ms, &url)
            .await;
        match result {
            Ok(v) => {
                self.cache.put(ns, &id.to_string(), &v, self.ttl);
                Ok(v)
            }
            Err(HttpError::NotFound(_)) => Err(EsiError::NotFound(id.to_string())),
            Err(HttpError::Forbidden(_)) => Err(EsiError::Forbidden(id.to_string())),
            Err(HttpError::ServerError(_, _)) => Err(EsiError::ServerError),
            Err(e) => Err(EsiError::Api(e)),
        }
    }

    /// Batches distinct ids through `resolve_entity`, bounded by
    /// `max_concurrency` (used by the enricher's parallel resolution pass),
    /// itself capped by `self.max_concurrency`.
    pub async fn ship_types_batch(
        &self,
        ids: &[u32],
        max_concurrency: usize,
    ) -> Vec<(u32, Result<EsiType, EsiError>)> {
        use futures::stream::{self, StreamExt};
        let concurrency = max_concurrency.min(self.max_concurrency).max(1);
        stream::iter(ids.iter().copied())
            .map(|id| async move { (id, self.ship_type(id).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    pub async fn characters_batch(
        &self,
        ids: &[u64],
        max_concurrency: usize,
    ) -> Vec<(u64, Result<EsiCharacter, EsiError>)> {
        use futures::stream::{self, StreamExt};
        let concurrency = max_concurrency.min(self.max_concurrency).max(1);
        stream::iter(ids.iter().copied())
            .map(|id| async move { (id, self.character(id).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Fetches a killmail body by id+hash — the "reference" shape's second
    /// half: the RedisQ/history feed gives id+hash, ESI gives the
    /// rest. Cached under a much longer TTL since a killmail body is
    /// immutable once it exists.
    pub async fn killmail(&self, killmail_id: i64, hash: &str) -> Result<crate::models::RawKillmail, EsiError> {
        let key = format!("{killmail_id}:{hash}");
        if let Some(v) = self.cache.get::<crate::models::RawKillmail>(cache::NS_ESI_KILLMAIL, &key) {
            return Ok(v);
        }
        let url = format!("{ESI_BASE}killmails/{killmail_id}/{hash}/");
        let result = self
            .fetcher
            .get_json::<crate::models::RawKillmail>(ESI_SERVICE, Priority::Realtime, self.queue_timeout_ms, &url)
            .await;
        match result {
            Ok(v) => {
                self.cache.put(cache::NS_ESI_KILLMAIL, &key, &v, self.killmail_ttl);
                Ok(v)
            }
            Err(HttpError::NotFound(_)) => Err(EsiError::NotFound(key)),
            Err(e) => Err(EsiError::Api(e)),
        }
    }
}

/// Fixed ship-group catalogue bootstrap: the upstream CSV loader is
/// out of scope, so ship category classification for these well-known
/// group ids is seeded directly rather than resolved through ESI.
pub fn bootstrap_ship_categories() -> std::collections::HashMap<u32, &'static str> {
    use std::collections::HashMap;
    let mut map = HashMap::new();
    for &id in &[25, 26, 27, 28, 29, 420, 541] {
        map.insert(id, "frigate");
    }
    for &id in &[419, 540] {
        map.insert(id, "cruiser");
    }
    for &id in &[547, 485] {
        map.insert(id, "battleship");
    }
    for &id in &[30, 659] {
        map.insert(id, "titan");
    }
    map.insert(31, "freighter");
    map.insert(463, "industrial");
    map.insert(833, "strategic_cruiser");
    map
}
