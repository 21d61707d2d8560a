use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

pub mod broadcaster;
pub mod cache;
pub mod channel;
pub mod clock;
pub mod coalescer;
pub mod config;
pub mod enricher;
pub mod error;
pub mod esi;
pub mod event_store;
pub mod http_fetcher;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod preloader;
pub mod rate_limiter;
pub mod redis_q;
pub mod subscription;
pub mod subscription_index;
pub mod subscription_worker;
pub mod webhook;
pub mod zkb_fetcher;

use broadcaster::Broadcaster;
use cache::Cache;
use clock::system_clock;
use config::AppConfig;
use enricher::Enricher;
use esi::EsiResolver;
use event_store::EventStore;
use http_fetcher::HttpFetcher;
use pipeline::KillmailPipeline;
use preloader::{PreloadLimits, Preloader};
use rate_limiter::{service_limits_from_config, RateLimiter};
use redis_q::{RedisQIngester, RedisQPacing};
use subscription::{SubscriptionLimits, SubscriptionManager};
use webhook::WebhookNotifier;
use zkb_fetcher::ZkbFetcher;

const REDISQ_URL: &str = "https://zkillredisq.stream/listen.php";
const REDISQ_QUEUE_PREFIX: &str = "wanderer-kills";

/// Every long-lived singleton the service wires up at startup.
/// Held behind `Arc` so each component and every spawned task can clone a
/// handle without taking a lock on the whole state.
pub struct AppState {
    pub config: AppConfig,
    pub cache: Arc<Cache>,
    pub events: Arc<EventStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_fetcher: Arc<HttpFetcher>,
    pub esi: Arc<EsiResolver>,
    pub zkb: Arc<ZkbFetcher>,
    pub enricher: Arc<Enricher>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub webhooks: Arc<WebhookNotifier>,
    pub preloader: Arc<Preloader>,
    pub pipeline: Arc<KillmailPipeline>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let clock = system_clock();
        let events = Arc::new(EventStore::new(clock.clone(), config.killmail_store_max_events_per_system));
        let cache = Arc::new(Cache::new(clock.clone(), events.clone()));

        let rate_limiter = Arc::new(RateLimiter::new(clock.clone()));
        rate_limiter.register_service("zkb", service_limits_from_config(&config, "zkb"));
        rate_limiter.register_service("esi", service_limits_from_config(&config, "esi"));

        let http_fetcher = Arc::new(HttpFetcher::new(
            &config.user_agent,
            rate_limiter.clone(),
            config.retry_http_max_retries,
            Duration::from_millis(config.retry_http_base_delay_ms),
            Duration::from_millis(config.retry_http_max_delay_ms),
            Duration::from_secs(config.esi_timeout_secs),
            Duration::from_secs(config.zkb_timeout_secs),
        ));

        let esi = Arc::new(EsiResolver::new(
            http_fetcher.clone(),
            cache.clone(),
            Duration::from_secs(config.cache_esi_ttl_secs),
            Duration::from_secs(config.cache_esi_killmail_ttl_secs),
            config.ratelimit_queue_timeout_ms,
            config.max_concurrency_esi,
        ));

        let zkb = Arc::new(ZkbFetcher::new(http_fetcher.clone(), config.ratelimit_queue_timeout_ms));

        let enricher = Arc::new(Enricher::new(
            esi.clone(),
            config.enricher_max_concurrency,
            config.enricher_min_attackers_for_parallel,
            Duration::from_secs(config.enricher_task_timeout_secs),
        ));

        let broadcaster = Arc::new(Broadcaster::new());
        let webhooks = Arc::new(WebhookNotifier::new(
            config.user_agent.clone(),
            config.webhook_max_failures,
            Duration::from_secs(config.webhook_timeout_secs),
            broadcaster.clone(),
        ));

        let preloader = Arc::new(Preloader::new(
            zkb.clone(),
            esi.clone(),
            cache.clone(),
            PreloadLimits {
                limit_per_system_cap: config.preload_limit_per_system_cap,
                since_hours_cap: config.preload_since_hours_cap,
                default_delivery_batch_size: config.preload_default_delivery_batch_size,
                max_delivery_batch_size: config.preload_max_delivery_batch_size,
                default_delivery_interval: Duration::from_millis(config.preload_default_delivery_interval_ms),
                competes_with_realtime: config.preload_competes_with_realtime,
            },
        ));

        let subscriptions = Arc::new(SubscriptionManager::new(
            SubscriptionLimits {
                max_systems_websocket: config.subscription_max_systems_websocket,
                max_systems_webhook: config.subscription_max_systems_webhook,
                max_characters: config.subscription_max_characters,
                worker_inbox_capacity: config.subscription_worker_inbox_capacity,
                worker_max_restarts: config.subscription_max_restarts,
                worker_restart_window_secs: config.subscription_restart_window_secs,
            },
            webhooks.clone(),
            preloader.clone(),
        ));

        let pipeline = Arc::new(KillmailPipeline::new(
            enricher.clone(),
            cache.clone(),
            subscriptions.clone(),
            broadcaster.clone(),
            Duration::from_secs(config.cache_killmails_ttl_secs),
            config.concurrency_batch_size.min(32).max(1),
            config.ratelimit_max_queue,
        ));

        AppState {
            config,
            cache,
            events,
            rate_limiter,
            http_fetcher,
            esi,
            zkb,
            enricher,
            subscriptions,
            broadcaster,
            webhooks,
            preloader,
            pipeline,
        }
    }

    /// Spawns the periodic GC sweep for the cache and the event store
    /// : dead entries are also reclaimed lazily on read, but a
    /// background sweep keeps memory bounded even for keys nobody reads
    /// again.
    pub fn spawn_background_sweeps(self: &Arc<Self>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(state.config.killmail_store_gc_interval_ms));
            loop {
                interval.tick().await;
                state.cache.sweep();
                let reclaimed = state.events.gc(Duration::from_secs(state.config.cache_system_ttl_secs).as_millis() as i64);
                if reclaimed > 0 {
                    info!("gc: reclaimed {reclaimed} stale system event ring(s)");
                }
                let swept = state.subscriptions.sweep_indices();
                if swept > 0 {
                    info!("gc: swept {swept} empty subscription index bucket(s)");
                }
            }
        });
    }
}

fn generate_queue_id() -> String {
    use rand::{distributions::Alphanumeric, Rng};
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(12).map(char::from).collect();
    format!("{REDISQ_QUEUE_PREFIX}-{suffix}")
}

pub async fn run() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting wanderer-kills...");

    let config = match config::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load application configuration: {}", e);
            return;
        }
    };

    let state = Arc::new(AppState::new(config));
    state.spawn_background_sweeps();

    let queue_id = generate_queue_id();
    let ingester = RedisQIngester::new(
        REDISQ_URL,
        &queue_id,
        &state.config.user_agent,
        RedisQPacing {
            fast_interval: Duration::from_millis(state.config.redisq_fast_interval_ms),
            idle_interval: Duration::from_millis(state.config.redisq_idle_interval_ms),
            initial_backoff: Duration::from_millis(state.config.redisq_initial_backoff_ms),
            max_backoff: Duration::from_millis(state.config.redisq_max_backoff_ms),
            backoff_factor: state.config.redisq_backoff_factor,
            empty_threshold: state.config.redisq_empty_threshold,
            poll_timeout: Duration::from_secs(state.config.redisq_poll_timeout_secs),
        },
    );

    info!("Listening for killmails from RedisQ (queue {queue_id})...");

    let pipeline = state.pipeline.clone();
    ingester
        .run(move |envelope| {
            let pipeline = pipeline.clone();
            async move {
                pipeline.submit(envelope);
            }
        })
        .await;
}
