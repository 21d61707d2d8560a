//! C11 — orchestrates parse -> enrich -> store -> broadcast for every
//! killmail the ingester (C9) hands it. A fixed pool of worker tasks reads
//! from a bounded channel so one slow enrichment can't stall the whole
//! RedisQ poll loop; each worker is independent, so a single panic only
//! drops the killmail it was processing.

use crate::broadcaster::{self, Broadcaster};
use crate::cache::{self, Cache};
use crate::channel::OutboundEvent;
use crate::enricher::Enricher;
use crate::models::{Killmail, RedisQEnvelope};
use crate::parser::{self, ParsedShape};
use crate::subscription::SubscriptionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct PipelineStats {
    pub processed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub partial_enrichments: AtomicU64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        PipelineStats {
            processed: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            partial_enrichments: AtomicU64::new(0),
        }
    }
}

pub struct KillmailPipeline {
    enricher: Arc<Enricher>,
    cache: Arc<Cache>,
    subscriptions: Arc<SubscriptionManager>,
    broadcaster: Arc<Broadcaster>,
    killmail_ttl: Duration,
    stats: Arc<PipelineStats>,
    inbox: mpsc::Sender<RedisQEnvelope>,
}

impl KillmailPipeline {
    pub fn new(
        enricher: Arc<Enricher>,
        cache: Arc<Cache>,
        subscriptions: Arc<SubscriptionManager>,
        broadcaster: Arc<Broadcaster>,
        killmail_ttl: Duration,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..worker_count {
            let enricher = enricher.clone();
            let cache = cache.clone();
            let subscriptions = subscriptions.clone();
            let broadcaster = broadcaster.clone();
            let stats = stats.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(envelope) = envelope else {
                        info!("pipeline worker {worker_id}: channel closed, exiting");
                        return;
                    };
                    process_one(&enricher, &cache, &subscriptions, &broadcaster, killmail_ttl, &stats, envelope).await;
                }
            });
        }

        KillmailPipeline {
            enricher,
            cache,
            subscriptions,
            broadcaster,
            killmail_ttl,
            stats,
            inbox: tx,
        }
    }

    /// Submits a poll result for processing. Never blocks the ingester
    /// loop: a full queue drops the envelope with a warning rather than
    /// backpressuring RedisQ polling, since a stalled pipeline must not
    /// stall discovery of new kills.
    pub fn submit(&self, envelope: RedisQEnvelope) {
        if let Err(e) = self.inbox.try_send(envelope) {
            warn!("pipeline: queue full, dropping envelope: {e}");
        }
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.processed.load(Ordering::Relaxed),
            self.stats.parse_errors.load(Ordering::Relaxed),
            self.stats.partial_enrichments.load(Ordering::Relaxed),
        )
    }
}

async fn process_one(
    enricher: &Enricher,
    cache: &Cache,
    subscriptions: &SubscriptionManager,
    broadcaster: &Broadcaster,
    killmail_ttl: Duration,
    stats: &PipelineStats,
    envelope: RedisQEnvelope,
) {
    let killmail = match parser::parse_redisq(&envelope) {
        Ok(ParsedShape::StreamFull(km)) => km,
        Ok(ParsedShape::StreamEmpty) => return,
        Ok(ParsedShape::Reference { .. }) => return,
        Err(e) => {
            stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            warn!("pipeline: failed to parse killmail: {e}");
            return;
        }
    };

    let mut killmail = killmail;
    let outcome = enricher.enrich(&mut killmail).await;
    if outcome == crate::enricher::EnrichOutcome::Partial {
        stats.partial_enrichments.fetch_add(1, Ordering::Relaxed);
    }

    store(cache, &killmail, killmail_ttl);

    let delivered_ws = subscriptions.broadcast_killmails(&killmail).await;
    let delivered_topic = broadcaster.broadcast(
        &broadcaster::topic_system(killmail.system_id),
        OutboundEvent::Killmail { killmail: killmail.clone() },
    );
    broadcaster.broadcast(broadcaster::TOPIC_ALL_SYSTEMS, OutboundEvent::Killmail { killmail: killmail.clone() });

    let count = cache.increment_system_count(killmail.system_id);
    broadcaster.broadcast(
        &broadcaster::topic_system_count(killmail.system_id),
        OutboundEvent::KillmailCount { system_id: killmail.system_id, count },
    );

    stats.processed.fetch_add(1, Ordering::Relaxed);
    if delivered_ws == 0 && delivered_topic == 0 {
        debug!("pipeline: killmail {} had no subscribers", killmail.killmail_id);
    }
}

fn store(cache: &Cache, killmail: &Killmail, ttl: Duration) {
    cache.put(cache::NS_KILLMAIL, &killmail.killmail_id.to_string(), killmail, ttl);
    cache.add_system_killmail(killmail.system_id, killmail.killmail_id);
}
