//! Flat key/value configuration with sensible production defaults.
//! Loading itself is intentionally thin — defaults from `AppConfig::default()`
//! layered under `Environment::default().separator("__")` — because the
//! full env/file config hierarchy is an external collaborator.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub origin_host: String,

    pub cache_killmails_ttl_secs: u64,
    pub cache_system_ttl_secs: u64,
    pub cache_esi_ttl_secs: u64,
    pub cache_esi_killmail_ttl_secs: u64,

    pub retry_http_max_retries: u32,
    pub retry_http_base_delay_ms: u64,
    pub retry_http_max_delay_ms: u64,

    pub concurrency_batch_size: usize,
    pub enricher_max_concurrency: usize,
    pub enricher_min_attackers_for_parallel: usize,
    pub enricher_task_timeout_secs: u64,

    pub killmail_store_gc_interval_ms: u64,
    pub killmail_store_max_events_per_system: usize,

    pub parser_cutoff_seconds: i64,

    pub redisq_fast_interval_ms: u64,
    pub redisq_idle_interval_ms: u64,
    pub redisq_initial_backoff_ms: u64,
    pub redisq_max_backoff_ms: u64,
    pub redisq_backoff_factor: f64,
    pub redisq_empty_threshold: u32,
    pub redisq_poll_timeout_secs: u64,

    pub circuit_breaker_zkb_failure_threshold: u32,
    pub circuit_breaker_esi_failure_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
    pub circuit_breaker_half_open_successes: u32,

    pub zkb_bucket_capacity: f64,
    pub zkb_bucket_refill_per_sec: f64,
    pub esi_bucket_capacity: f64,
    pub esi_bucket_refill_per_sec: f64,
    pub ratelimit_max_queue: usize,
    pub ratelimit_queue_timeout_ms: u64,

    pub coalesce_timeout_ms: u64,

    pub esi_timeout_secs: u64,
    pub zkb_timeout_secs: u64,
    pub webhook_timeout_secs: u64,

    pub max_concurrency_esi: usize,

    pub subscription_max_systems_websocket: usize,
    pub subscription_max_systems_webhook: usize,
    pub subscription_max_characters: usize,
    pub subscription_worker_inbox_capacity: usize,
    pub subscription_max_restarts: u32,
    pub subscription_restart_window_secs: u64,

    pub webhook_max_failures: u32,

    pub preload_limit_per_system_cap: usize,
    pub preload_since_hours_cap: u64,
    pub preload_default_delivery_batch_size: usize,
    pub preload_max_delivery_batch_size: usize,
    pub preload_default_delivery_interval_ms: u64,
    pub preload_competes_with_realtime: bool,

    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            port: 4004,
            origin_host: "localhost".to_string(),

            cache_killmails_ttl_secs: 300,
            cache_system_ttl_secs: 3600,
            cache_esi_ttl_secs: 3600,
            cache_esi_killmail_ttl_secs: 86_400,

            retry_http_max_retries: 3,
            retry_http_base_delay_ms: 1000,
            retry_http_max_delay_ms: 30_000,

            concurrency_batch_size: 100,
            enricher_max_concurrency: 10,
            enricher_min_attackers_for_parallel: 3,
            enricher_task_timeout_secs: 30,

            killmail_store_gc_interval_ms: 60_000,
            killmail_store_max_events_per_system: 10_000,

            parser_cutoff_seconds: 3600,

            redisq_fast_interval_ms: 1000,
            redisq_idle_interval_ms: 5000,
            redisq_initial_backoff_ms: 1000,
            redisq_max_backoff_ms: 30_000,
            redisq_backoff_factor: 2.0,
            redisq_empty_threshold: 3,
            redisq_poll_timeout_secs: 10,

            circuit_breaker_zkb_failure_threshold: 10,
            circuit_breaker_esi_failure_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
            circuit_breaker_half_open_successes: 3,

            zkb_bucket_capacity: 150.0,
            zkb_bucket_refill_per_sec: 75.0,
            esi_bucket_capacity: 150.0,
            esi_bucket_refill_per_sec: 100.0,
            ratelimit_max_queue: 5000,
            ratelimit_queue_timeout_ms: 30_000,

            coalesce_timeout_ms: 30_000,

            esi_timeout_secs: 10,
            zkb_timeout_secs: 15,
            webhook_timeout_secs: 10,

            max_concurrency_esi: 10,

            subscription_max_systems_websocket: 50,
            subscription_max_systems_webhook: 100,
            subscription_max_characters: 1000,
            subscription_worker_inbox_capacity: 256,
            subscription_max_restarts: 5,
            subscription_restart_window_secs: 30,

            webhook_max_failures: 5,

            preload_limit_per_system_cap: 200,
            preload_since_hours_cap: 168,
            preload_default_delivery_batch_size: 10,
            preload_max_delivery_batch_size: 50,
            preload_default_delivery_interval_ms: 1000,
            // Backfill can starve realtime delivery of rate-limiter tokens, so
            // default preload to background priority so bulk backfill never
            // starves realtime delivery, and keep it configurable.
            preload_competes_with_realtime: false,

            user_agent: "wanderer-kills/0.1 (+https://github.com/wanderer-industries)"
                .to_string(),
        }
    }
}

pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    let settings = Config::builder()
        .add_source(config::Config::try_from(&AppConfig::default())?)
        .add_source(Environment::default().separator("__"))
        .build()?;
    settings.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cache_killmails_ttl_secs, 300);
        assert_eq!(cfg.cache_system_ttl_secs, 3600);
        assert_eq!(cfg.cache_esi_ttl_secs, 3600);
        assert_eq!(cfg.cache_esi_killmail_ttl_secs, 86_400);
        assert_eq!(cfg.retry_http_max_retries, 3);
        assert_eq!(cfg.retry_http_base_delay_ms, 1000);
        assert_eq!(cfg.retry_http_max_delay_ms, 30_000);
        assert_eq!(cfg.concurrency_batch_size, 100);
        assert_eq!(cfg.enricher_max_concurrency, 10);
        assert_eq!(cfg.enricher_min_attackers_for_parallel, 3);
        assert_eq!(cfg.killmail_store_gc_interval_ms, 60_000);
        assert_eq!(cfg.killmail_store_max_events_per_system, 10_000);
        assert_eq!(cfg.parser_cutoff_seconds, 3600);
        assert_eq!(cfg.redisq_fast_interval_ms, 1000);
        assert_eq!(cfg.redisq_idle_interval_ms, 5000);
        assert_eq!(cfg.redisq_max_backoff_ms, 30_000);
        assert_eq!(cfg.circuit_breaker_zkb_failure_threshold, 10);
        assert_eq!(cfg.circuit_breaker_esi_failure_threshold, 5);
    }
}
