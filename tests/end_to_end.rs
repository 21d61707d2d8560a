use std::sync::Arc;
use std::time::Duration;
use wanderer_kills::broadcaster::Broadcaster;
use wanderer_kills::cache::Cache;
use wanderer_kills::channel::{ChannelSink, OutboundEvent, RecordingSink};
use wanderer_kills::clock::FakeClock;
use wanderer_kills::esi::EsiResolver;
use wanderer_kills::event_store::EventStore;
use wanderer_kills::http_fetcher::HttpFetcher;
use wanderer_kills::models::{RawAttacker, RawKillmail, RawPackage, RawVictim, RawZkb, RedisQEnvelope};
use wanderer_kills::parser::{self, ParsedShape};
use wanderer_kills::preloader::{PreloadLimits, Preloader};
use wanderer_kills::rate_limiter::RateLimiter;
use wanderer_kills::subscription::{SubscriptionKind, SubscriptionLimits, SubscriptionManager, SubscriptionRequest};
use wanderer_kills::webhook::WebhookNotifier;
use wanderer_kills::zkb_fetcher::ZkbFetcher;

/// Builds a manager with real webhook/preloader collaborators; none of the
/// tests here trigger a delivery that would reach the network.
fn test_manager(limits: SubscriptionLimits) -> SubscriptionManager {
    let broadcaster = Arc::new(Broadcaster::new());
    let webhooks = Arc::new(WebhookNotifier::new(
        "wanderer-kills/0.1".to_string(),
        5,
        Duration::from_secs(5),
        broadcaster,
    ));

    let clock = Arc::new(FakeClock::new(0));
    let events = Arc::new(EventStore::new(clock.clone(), 100));
    let cache = Arc::new(Cache::new(clock.clone(), events));
    let rate_limiter = Arc::new(RateLimiter::new(clock));
    let http_fetcher = Arc::new(HttpFetcher::new(
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
    let preloader = Arc::new(Preloader::new(
        zkb,
        esi,
        cache,
        PreloadLimits {
            limit_per_system_cap: 10,
            since_hours_cap: 168,
            default_delivery_batch_size: 10,
            max_delivery_batch_size: 10,
            default_delivery_interval: Duration::from_millis(0),
            competes_with_realtime: false,
        },
    ));

    SubscriptionManager::new(limits, webhooks, preloader)
}

fn websocket_request(system_ids: Vec<u32>, character_ids: Vec<u64>) -> SubscriptionRequest {
    SubscriptionRequest { kind: SubscriptionKind::Websocket, system_ids, character_ids, webhook_url: None, preload: None }
}

fn sample_envelope(system_id: u32, victim_character_id: u64) -> RedisQEnvelope {
    RedisQEnvelope {
        package: Some(RawPackage {
            killmail: RawKillmail {
                killmail_id: 42,
                solar_system_id: system_id,
                killmail_time: "2026-07-31T10:00:00Z".to_string(),
                victim: RawVictim {
                    character_id: Some(victim_character_id),
                    corporation_id: Some(1000),
                    alliance_id: None,
                    faction_id: None,
                    ship_type_id: 587,
                    damage_taken: 1200,
                    position: None,
                },
                attackers: vec![RawAttacker {
                    character_id: Some(777),
                    corporation_id: Some(2000),
                    alliance_id: None,
                    faction_id: None,
                    ship_type_id: Some(621),
                    weapon_type_id: Some(2488),
                    damage_done: 1200,
                    final_blow: true,
                    security_status: 0.3,
                }],
            },
            zkb: RawZkb {
                hash: "deadbeef".to_string(),
                total_value: 50_000_000.0,
                ..Default::default()
            },
        }),
    }
}

/// The realtime path: a full RedisQ package parses cleanly into a
/// well-formed killmail and reaches a subscription watching its system.
#[tokio::test]
async fn full_ingest_path_delivers_to_matching_system_subscription() {
    let envelope = sample_envelope(30000142, 555);
    let killmail = match parser::parse_redisq(&envelope).unwrap() {
        ParsedShape::StreamFull(km) => km,
        _ => panic!("expected a fully parsed killmail"),
    };
    assert!(killmail.is_well_formed());

    let manager = test_manager(SubscriptionLimits {
        max_systems_websocket: 50,
        max_systems_webhook: 100,
        max_characters: 1000,
        worker_inbox_capacity: 16,
        worker_max_restarts: 5,
        worker_restart_window_secs: 30,
    });
    let sink = Arc::new(RecordingSink::new());
    manager.add(websocket_request(vec![30000142], vec![]), sink.clone()).unwrap();

    let delivered = manager.broadcast_killmails(&killmail).await;
    assert_eq!(delivered, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = sink.drain();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], OutboundEvent::Killmail { .. }));
}

/// A character-only subscription matches regardless of which system the
/// kill happened in (OR-match semantics).
#[tokio::test]
async fn character_subscription_matches_across_systems() {
    let envelope = sample_envelope(30000001, 555);
    let killmail = match parser::parse_redisq(&envelope).unwrap() {
        ParsedShape::StreamFull(km) => km,
        _ => panic!("expected a fully parsed killmail"),
    };

    let manager = test_manager(SubscriptionLimits {
        max_systems_websocket: 50,
        max_systems_webhook: 100,
        max_characters: 1000,
        worker_inbox_capacity: 16,
        worker_max_restarts: 5,
        worker_restart_window_secs: 30,
    });
    let sink = Arc::new(RecordingSink::new());
    manager.add(websocket_request(vec![], vec![555]), sink).unwrap();

    assert_eq!(manager.broadcast_killmails(&killmail).await, 1);
}

/// A killmail outside every subscription's filters reaches nobody, but the
/// pipeline still considers it processed rather than an error.
#[tokio::test]
async fn unmatched_killmail_delivers_to_nobody() {
    let envelope = sample_envelope(30000002, 9999);
    let killmail = match parser::parse_redisq(&envelope).unwrap() {
        ParsedShape::StreamFull(km) => km,
        _ => panic!("expected a fully parsed killmail"),
    };

    let manager = test_manager(SubscriptionLimits {
        max_systems_websocket: 50,
        max_systems_webhook: 100,
        max_characters: 1000,
        worker_inbox_capacity: 16,
        worker_max_restarts: 5,
        worker_restart_window_secs: 30,
    });
    let sink = Arc::new(RecordingSink::new());
    manager.add(websocket_request(vec![30000142], vec![]), sink).unwrap();

    assert_eq!(manager.broadcast_killmails(&killmail).await, 0);
}

/// RecordingSink wiring sanity check used by the broadcaster/worker unit
/// tests elsewhere: a closed sink rejects further sends.
#[test]
fn recording_sink_rejects_sends_after_close() {
    let sink = RecordingSink::new();
    sink.close();
    assert!(sink.send(OutboundEvent::KillmailCount { system_id: 1, count: 1 }).is_err());
}
