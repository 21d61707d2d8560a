//! The opaque duplex transport the broadcaster and subscription
//! workers push events through. The concrete WebSocket/webhook wiring is
//! out of scope; this trait is the seam a production transport and a test
//! double both implement.

use crate::models::Killmail;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Killmail { killmail: Killmail },
    KillmailCount { system_id: u32, count: u64 },
    PreloadStatus { subscription_id: String, state: String },
    PreloadBatch { subscription_id: String, killmails: Vec<Killmail>, batch_number: u32 },
    PreloadComplete { subscription_id: String, total_delivered: u64 },
    WebhookDisabled { subscription_id: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("sink is closed")]
pub struct SinkClosed;

pub trait ChannelSink: Send + Sync {
    fn send(&self, event: OutboundEvent) -> Result<(), SinkClosed>;
    fn is_closed(&self) -> bool;
}

/// In-memory sink used by tests and by the preloader/webhook layers when
/// they need to observe what would have gone out over a real transport.
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<OutboundEvent>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        RecordingSink {
            events: std::sync::Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn drain(&self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl ChannelSink for RecordingSink {
    fn send(&self, event: OutboundEvent) -> Result<(), SinkClosed> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(SinkClosed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }
}
