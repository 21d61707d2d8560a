//! C17 — on-join backfill. When a subscription is created it may ask for
//! recent history; the preloader serves it from the killmail cache (C1)
//! first and only falls through to zkb/ESI (C10/C6) for systems or ids the
//! cache doesn't have, then delivers it in batches directly to the new
//! subscription's own inbox — never through the broadcaster, since other
//! subscriptions must not see a replay of old kills.
//!
//! Event ordering is a hard contract: one `PreloadStatus` first,
//! then zero or more `PreloadBatch`, then exactly one `PreloadComplete`.

use crate::cache::{self, Cache};
use crate::channel::OutboundEvent;
use crate::esi::EsiResolver;
use crate::models::Killmail;
use crate::rate_limiter::Priority;
use crate::zkb_fetcher::ZkbFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::warn;

pub struct PreloadLimits {
    pub limit_per_system_cap: usize,
    pub since_hours_cap: u64,
    pub default_delivery_batch_size: usize,
    pub max_delivery_batch_size: usize,
    pub default_delivery_interval: Duration,
    pub competes_with_realtime: bool,
}

pub struct PreloadRequest {
    pub subscription_id: String,
    pub system_ids: Vec<u32>,
    pub limit_per_system: Option<usize>,
    pub since_hours: Option<u64>,
    pub batch_size: Option<usize>,
}

pub struct Preloader {
    zkb: Arc<ZkbFetcher>,
    esi: Arc<EsiResolver>,
    cache: Arc<Cache>,
    limits: PreloadLimits,
}

impl Preloader {
    pub fn new(zkb: Arc<ZkbFetcher>, esi: Arc<EsiResolver>, cache: Arc<Cache>, limits: PreloadLimits) -> Self {
        Preloader { zkb, esi, cache, limits }
    }

    fn priority(&self) -> Priority {
        if self.limits.competes_with_realtime {
            Priority::Preload
        } else {
            Priority::Background
        }
    }

    /// Serves a system's recent history from `EventStore`'s id ring plus
    /// the killmail cache when possible; only the ids or bodies missing
    /// from cache fall through to zkb/ESI.
    async fn system_history(&self, system_id: u32, limit: usize) -> Vec<Killmail> {
        let cached_ids = self.cache.list_system_killmails(system_id, limit);
        if cached_ids.is_empty() {
            return self.fetch_system_history(system_id, limit).await;
        }

        let mut killmails = Vec::with_capacity(cached_ids.len());
        let mut missing = false;
        for id in &cached_ids {
            match self.cache.get::<Killmail>(cache::NS_KILLMAIL, &id.to_string()) {
                Some(km) => killmails.push(km),
                None => {
                    missing = true;
                    break;
                }
            }
        }

        if missing {
            return self.fetch_system_history(system_id, limit).await;
        }
        killmails
    }

    async fn fetch_system_history(&self, system_id: u32, limit: usize) -> Vec<Killmail> {
        let mut killmails = Vec::new();
        match self.zkb.system_kills(system_id, limit, self.priority()).await {
            Ok(refs) => {
                for reference in refs {
                    match self.esi.killmail(reference.killmail_id, &reference.zkb.hash).await {
                        Ok(raw) => match crate::parser::normalize(&raw, &reference.zkb) {
                            Ok(km) => killmails.push(km),
                            Err(e) => warn!("preloader: failed to normalize killmail {}: {e}", reference.killmail_id),
                        },
                        Err(e) => warn!("preloader: failed to fetch killmail {}: {e}", reference.killmail_id),
                    }
                }
            }
            Err(e) => warn!("preloader: failed to fetch system {system_id} history: {e}"),
        }
        killmails
    }

    /// Runs the full backfill, pushing events onto `inbox` in the
    /// status -> batch* -> complete order the client-facing contract
    /// requires. Per-system fetch failures are logged and skipped rather
    /// than aborting the whole preload (partial backfill still completes).
    pub async fn run(&self, request: PreloadRequest, inbox: Sender<OutboundEvent>) {
        let subscription_id = request.subscription_id.clone();
        let _ = inbox
            .send(OutboundEvent::PreloadStatus {
                subscription_id: subscription_id.clone(),
                state: "running".to_string(),
            })
            .await;

        let limit = request
            .limit_per_system
            .unwrap_or(self.limits.limit_per_system_cap)
            .min(self.limits.limit_per_system_cap);
        let batch_size = request
            .batch_size
            .unwrap_or(self.limits.default_delivery_batch_size)
            .min(self.limits.max_delivery_batch_size)
            .max(1);
        let since_hours = request.since_hours.unwrap_or(self.limits.since_hours_cap).min(self.limits.since_hours_cap);
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(since_hours as i64);

        let mut killmails = Vec::new();
        for system_id in &request.system_ids {
            let history = self.system_history(*system_id, limit).await;
            killmails.extend(history.into_iter().filter(|km| km.kill_time >= cutoff));
        }

        killmails.sort_by(|a, b| b.kill_time.cmp(&a.kill_time));

        let total = killmails.len() as u64;
        for (batch_number, chunk) in killmails.chunks(batch_size).enumerate() {
            let sent = inbox
                .send(OutboundEvent::PreloadBatch {
                    subscription_id: subscription_id.clone(),
                    killmails: chunk.to_vec(),
                    batch_number: batch_number as u32,
                })
                .await;
            if sent.is_err() {
                warn!("preloader: subscription {subscription_id} inbox closed mid-backfill");
                return;
            }
            if !self.limits.default_delivery_interval.is_zero() {
                tokio::time::sleep(self.limits.default_delivery_interval).await;
            }
        }

        let _ = inbox
            .send(OutboundEvent::PreloadComplete {
                subscription_id,
                total_delivered: total,
            })
            .await;
    }
}

#[allow(dead_code)]
fn dedup_by_id(killmails: Vec<Killmail>) -> Vec<Killmail> {
    let mut seen = std::collections::HashSet::new();
    killmails.into_iter().filter(|k| seen.insert(k.killmail_id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::event_store::EventStore;
    use crate::models::{Participant, ZkbMeta};
    use crate::rate_limiter::RateLimiter;

    #[test]
    fn batch_size_is_clamped_between_one_and_the_configured_max() {
        let limits = PreloadLimits {
            limit_per_system_cap: 200,
            since_hours_cap: 168,
            default_delivery_batch_size: 10,
            max_delivery_batch_size: 50,
            default_delivery_interval: Duration::from_millis(0),
            competes_with_realtime: false,
        };
        let requested = 500usize.min(limits.max_delivery_batch_size).max(1);
        assert_eq!(requested, 50);
    }

    fn preloader_with_cache() -> (Preloader, Arc<Cache>) {
        let clock = Arc::new(FakeClock::new(0));
        let events = Arc::new(EventStore::new(clock.clone(), 100));
        let cache = Arc::new(Cache::new(clock.clone(), events));
        let rate_limiter = Arc::new(RateLimiter::new(clock.clone()));
        let http_fetcher = Arc::new(crate::http_fetcher::HttpFetcher::new(
            "wanderer-kills/0.1",
            rate_limiter,
            0,
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let zkb = Arc::new(ZkbFetcher::new(http_fetcher.clone(), 1));
        let esi = Arc::new(EsiResolver::new(http_fetcher, cache.clone(), Duration::from_secs(60), Duration::from_secs(60), 1, 1));
        let limits = PreloadLimits {
            limit_per_system_cap: 10,
            since_hours_cap: 168,
            default_delivery_batch_size: 10,
            max_delivery_batch_size: 10,
            default_delivery_interval: Duration::from_millis(0),
            competes_with_realtime: false,
        };
        let preloader = Preloader::new(zkb, esi, cache.clone(), limits);
        (preloader, cache)
    }

    fn sample_killmail(id: i64, system_id: u32) -> Killmail {
        Killmail {
            killmail_id: id,
            kill_time: chrono::Utc::now(),
            system_id,
            victim: Participant::default(),
            attackers: vec![Participant { final_blow: true, ..Default::default() }],
            zkb: ZkbMeta { hash: "h".into(), total_value: 0.0, points: 0, npc: false, solo: false, awox: false, labels: vec![] },
            position: None,
        }
    }

    #[tokio::test]
    async fn system_history_is_served_from_cache_without_touching_zkb() {
        let (preloader, cache) = preloader_with_cache();
        let km = sample_killmail(42, 30000142);
        cache.put(cache::NS_KILLMAIL, "42", &km, Duration::from_secs(60));
        cache.add_system_killmail(30000142, 42);

        let history = preloader.system_history(30000142, 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].killmail_id, 42);
    }
}
