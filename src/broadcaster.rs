//! C15 — topic-keyed pub/sub fan-out: topic -> subscriber list, zero
//! central lock on the hot publish path since each topic's sink list is its
//! own DashMap entry. Topic shapes: `system:<id>`, `system:<id>:detailed`,
//! `all_systems`, `system:count:<id>`, `subscription:<id>:status`.

use crate::channel::{ChannelSink, OutboundEvent};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub const TOPIC_ALL_SYSTEMS: &str = "all_systems";

pub fn topic_system(system_id: u32) -> String {
    format!("system:{system_id}")
}

pub fn topic_system_detailed(system_id: u32) -> String {
    format!("system:{system_id}:detailed")
}

pub fn topic_system_count(system_id: u32) -> String {
    format!("system:count:{system_id}")
}

pub fn topic_subscription_status(subscription_id: &str) -> String {
    format!("subscription:{subscription_id}:status")
}

struct Subscriber {
    id: u64,
    sink: Arc<dyn ChannelSink>,
}

pub struct Broadcaster {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    pub topic: String,
    pub id: u64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            topics: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, topic: &str, sink: Arc<dyn ChannelSink>) -> Subscription {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        Subscription { topic: topic.to_string(), id }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(mut subscribers) = self.topics.get_mut(&subscription.topic) {
            subscribers.retain(|s| s.id != subscription.id);
        }
    }

    /// Fans `event` out to every sink registered on `topic`, pruning any
    /// that report closed. A clone per subscriber is unavoidable since each
    /// sink owns its own serialization path, and every live subscriber must
    /// get its own delivery.
    pub fn broadcast(&self, topic: &str, event: OutboundEvent) -> usize {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            return 0;
        };
        let before = subscribers.len();
        subscribers.retain(|s| !s.sink.is_closed());
        if subscribers.len() != before {
            debug!("broadcaster: pruned {} closed subscriber(s) from {topic}", before - subscribers.len());
        }
        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            if subscriber.sink.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingSink;
    use crate::models::{Killmail, Participant, ZkbMeta};

    fn sample_killmail() -> Killmail {
        Killmail {
            killmail_id: 1,
            kill_time: chrono::Utc::now(),
            system_id: 30000142,
            victim: Participant::default(),
            attackers: vec![Participant { final_blow: true, ..Default::default() }],
            zkb: ZkbMeta {
                hash: "x".into(),
                total_value: 0.0,
                points: 0,
                npc: false,
                solo: false,
                awox: false,
                labels: vec![],
            },
            position: None,
        }
    }

    #[test]
    fn broadcast_delivers_to_every_live_subscriber_on_the_topic() {
        let broadcaster = Broadcaster::new();
        let sink1 = Arc::new(RecordingSink::new());
        let sink2 = Arc::new(RecordingSink::new());
        broadcaster.subscribe(&topic_system(30000142), sink1.clone());
        broadcaster.subscribe(&topic_system(30000142), sink2.clone());

        let delivered = broadcaster.broadcast(
            &topic_system(30000142),
            OutboundEvent::Killmail { killmail: sample_killmail() },
        );

        assert_eq!(delivered, 2);
        assert_eq!(sink1.drain().len(), 1);
        assert_eq!(sink2.drain().len(), 1);
    }

    #[test]
    fn closed_sinks_are_pruned_and_do_not_count_as_delivered() {
        let broadcaster = Broadcaster::new();
        let sink = Arc::new(RecordingSink::new());
        broadcaster.subscribe(&topic_system(1), sink.clone());
        sink.close();

        let delivered = broadcaster.broadcast(&topic_system(1), OutboundEvent::KillmailCount { system_id: 1, count: 0 });
        assert_eq!(delivered, 0);
        assert_eq!(broadcaster.subscriber_count(&topic_system(1)), 0);
    }

    #[test]
    fn unsubscribe_removes_only_the_matching_subscriber() {
        let broadcaster = Broadcaster::new();
        let sink1 = Arc::new(RecordingSink::new());
        let sink2 = Arc::new(RecordingSink::new());
        let sub1 = broadcaster.subscribe(&topic_system(1), sink1);
        broadcaster.subscribe(&topic_system(1), sink2);

        broadcaster.unsubscribe(&sub1);
        assert_eq!(broadcaster.subscriber_count(&topic_system(1)), 1);
    }
}
