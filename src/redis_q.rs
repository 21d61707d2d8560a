//! C9 — long-poll ingester over zKillboard's RedisQ: a single GET with a
//! server-side timeout and queueID in the query string, driven by a loop
//! with adaptive pacing: fast while kills are arriving, idle once several
//! consecutive polls come back empty, and backed off on error.

use crate::error::RedisQError;
use crate::models::RedisQEnvelope;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Active,
    Idle,
    Backoff,
}

pub struct RedisQPacing {
    pub fast_interval: Duration,
    pub idle_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub empty_threshold: u32,
    pub poll_timeout: Duration,
}

pub struct RedisQIngester {
    client: Client,
    url: String,
    pacing: RedisQPacing,
    shutdown: Arc<AtomicBool>,
}

impl RedisQIngester {
    pub fn new(base_url: &str, queue_id: &str, user_agent: &str, pacing: RedisQPacing) -> Self {
        let url = format!("{base_url}?queueID={queue_id}");
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .expect("reqwest client must build with a static user agent");
        RedisQIngester {
            client,
            url,
            pacing,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Polls once, returning `None` for an empty queue (`RedisQEnvelope`
    /// with `package: None`).
    async fn poll_once(&self) -> Result<Option<RedisQEnvelope>, RedisQError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.pacing.poll_timeout)
            .send()
            .await
            .map_err(|e| RedisQError::PollError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RedisQError::PollError(format!("status {}", response.status())));
        }

        let text = response
            .text()
            .await
            .map_err(|e| RedisQError::PollError(e.to_string()))?;

        if text.trim_start().starts_with("<!DOCTYPE") || text.trim_start().starts_with("<html") {
            return Err(RedisQError::PollError("received HTML instead of JSON".to_string()));
        }

        let envelope: RedisQEnvelope = serde_json::from_str(&text)
            .map_err(|e| RedisQError::PollError(format!("JSON parse error: {e}; body: {text}")))?;

        if envelope.package.is_some() {
            Ok(Some(envelope))
        } else {
            Ok(None)
        }
    }

    /// Drives the adaptive poll loop, invoking `on_package` for every
    /// non-empty poll. Exits cooperatively once `shutdown_handle()` is set.
    /// State transitions: `Active` while packages keep arriving, `Idle`
    /// after `empty_threshold` consecutive empty polls, `Backoff` with
    /// doubling delay (capped at `max_backoff`) on poll errors, reset to
    /// `Active` on the next success.
    pub async fn run<F, Fut>(&self, mut on_package: F)
    where
        F: FnMut(RedisQEnvelope) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut state = PollState::Active;
        let mut consecutive_empty = 0u32;
        let mut backoff = self.pacing.initial_backoff;

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll_once().await {
                Ok(Some(envelope)) => {
                    state = PollState::Active;
                    consecutive_empty = 0;
                    backoff = self.pacing.initial_backoff;
                    on_package(envelope).await;
                }
                Ok(None) => {
                    consecutive_empty += 1;
                    if consecutive_empty >= self.pacing.empty_threshold {
                        state = PollState::Idle;
                    }
                }
                Err(e) => {
                    warn!("redisq: poll failed: {e}");
                    state = PollState::Backoff;
                }
            }

            let delay = match state {
                PollState::Active => self.pacing.fast_interval,
                PollState::Idle => self.pacing.idle_interval,
                PollState::Backoff => {
                    let this = backoff;
                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.pacing.backoff_factor)
                            .min(self.pacing.max_backoff.as_secs_f64()),
                    );
                    this
                }
            };

            tokio::time::sleep(delay).await;
        }
        info!("redisq: ingester loop exiting on shutdown signal");
    }
}
