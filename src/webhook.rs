//! C16 — webhook delivery. Every delivery attempt is independent of the
//! rate limiter (webhooks are outbound to arbitrary third-party urls, not
//! one of the two upstreams C3 governs) but shares the same reqwest client
//! construction idiom as the rest of the HTTP surface. Failures follow a
//! fixed backoff schedule rather than the exponential one C5 uses, per
//! a webhook is disabled after too many consecutive failures.

use crate::broadcaster::{self, Broadcaster};
use crate::channel::OutboundEvent;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed retry schedule for a failed delivery: 1m, 5m, 15m, 1h,
/// then give up on that single delivery (the webhook itself isn't disabled
/// until `max_failures` separate killmails fail outright).
const RETRY_SCHEDULE: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
];

pub struct WebhookTarget {
    pub url: String,
    subscription_id: String,
    client: Client,
    broadcaster: Arc<Broadcaster>,
    consecutive_failures: AtomicU32,
    disabled: std::sync::atomic::AtomicBool,
    max_failures: u32,
    timeout: Duration,
}

impl WebhookTarget {
    pub fn new(
        subscription_id: String,
        url: String,
        user_agent: &str,
        max_failures: u32,
        timeout: Duration,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .expect("reqwest client must build with a static user agent");
        WebhookTarget {
            url,
            subscription_id,
            client,
            broadcaster,
            consecutive_failures: AtomicU32::new(0),
            disabled: std::sync::atomic::AtomicBool::new(false),
            max_failures,
            timeout,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    async fn post_once(&self, event: &OutboundEvent) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned status {}", response.status()))
        }
    }

    /// Delivers `event`, retrying on the fixed schedule until success or
    /// the schedule is exhausted. Disables the target after `max_failures`
    /// deliveries in a row fail outright.
    pub async fn deliver(&self, event: OutboundEvent) {
        if self.is_disabled() {
            return;
        }

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(RETRY_SCHEDULE).enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.post_once(&event).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!("webhook {} attempt {attempt}: {e}", self.url);
                }
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_failures {
            self.disabled.store(true, Ordering::Relaxed);
            warn!("webhook {} disabled after {failures} consecutive failures", self.url);
            self.broadcaster.broadcast(
                &broadcaster::topic_subscription_status(&self.subscription_id),
                OutboundEvent::WebhookDisabled { subscription_id: self.subscription_id.clone() },
            );
        }
    }
}

pub struct WebhookNotifier {
    targets: dashmap::DashMap<String, Arc<WebhookTarget>>,
    user_agent: String,
    max_failures: u32,
    timeout: Duration,
    broadcaster: Arc<Broadcaster>,
}

impl WebhookNotifier {
    pub fn new(user_agent: String, max_failures: u32, timeout: Duration, broadcaster: Arc<Broadcaster>) -> Self {
        WebhookNotifier {
            targets: dashmap::DashMap::new(),
            user_agent,
            max_failures,
            timeout,
            broadcaster,
        }
    }

    pub fn register(&self, subscription_id: &str, url: String) {
        self.targets.insert(
            subscription_id.to_string(),
            Arc::new(WebhookTarget::new(
                subscription_id.to_string(),
                url,
                &self.user_agent,
                self.max_failures,
                self.timeout,
                self.broadcaster.clone(),
            )),
        );
    }

    pub fn unregister(&self, subscription_id: &str) {
        self.targets.remove(subscription_id);
    }

    /// Spawns delivery as a background task so a slow/dead webhook target
    /// can't block the caller (the pipeline's broadcast path).
    pub fn notify(&self, subscription_id: &str, event: OutboundEvent) {
        let Some(target) = self.targets.get(subscription_id).map(|t| t.clone()) else {
            return;
        };
        tokio::spawn(async move {
            target.deliver(event).await;
        });
    }

    pub fn is_disabled(&self, subscription_id: &str) -> bool {
        self.targets.get(subscription_id).map(|t| t.is_disabled()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    #[test]
    fn retry_schedule_is_the_documented_four_steps() {
        assert_eq!(RETRY_SCHEDULE[0], Duration::from_secs(60));
        assert_eq!(RETRY_SCHEDULE[1], Duration::from_secs(300));
        assert_eq!(RETRY_SCHEDULE[2], Duration::from_secs(900));
        assert_eq!(RETRY_SCHEDULE[3], Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn unregistered_subscription_notify_is_a_noop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let notifier = WebhookNotifier::new("wanderer-kills/0.1".to_string(), 5, Duration::from_secs(10), broadcaster);
        notifier.notify("missing", OutboundEvent::KillmailCount { system_id: 1, count: 1 });
        info!("no panic expected");
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_a_target_publishes_webhook_disabled() {
        let broadcaster = Arc::new(Broadcaster::new());
        let sink = Arc::new(crate::channel::RecordingSink::new());
        broadcaster.subscribe(&broadcaster::topic_subscription_status("sub-1"), sink.clone());

        let target = WebhookTarget::new(
            "sub-1".to_string(),
            "http://127.0.0.1:0/webhook".to_string(),
            "wanderer-kills/0.1",
            1,
            Duration::from_millis(50),
            broadcaster,
        );
        target.deliver(OutboundEvent::KillmailCount { system_id: 1, count: 1 }).await;

        assert!(target.is_disabled());
        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OutboundEvent::WebhookDisabled { subscription_id } if subscription_id == "sub-1"));
    }
}
