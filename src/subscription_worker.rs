//! C13 — one supervised task per subscription. A worker owns a bounded
//! inbox; the manager (C14) pushes matched killmails into it and the
//! worker is solely responsible for turning those into sink sends, so a
//! panic inside one subscriber's delivery path can never take another
//! subscriber down with it.

use crate::channel::{ChannelSink, OutboundEvent};
use futures::FutureExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Active,
    Terminating,
}

pub struct SubscriptionWorkerHandle {
    pub inbox: mpsc::Sender<OutboundEvent>,
    state: Arc<std::sync::Mutex<WorkerState>>,
    restarts: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl SubscriptionWorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        *self.state.lock().unwrap() = WorkerState::Terminating;
        self.task.abort();
    }
}

/// Spawns a subscription's delivery task. The loop itself never returns an
/// `Err` — a send failure just logs and keeps draining the inbox, since one
/// bad sink write must not stop the worker from processing the next
/// killmail. Crash isolation instead comes from `spawn_supervised`, which
/// restarts the whole task if it panics.
pub fn spawn(
    subscription_id: String,
    sink: Arc<dyn ChannelSink>,
    inbox_capacity: usize,
    max_restarts: u32,
    restart_window_secs: u64,
) -> SubscriptionWorkerHandle {
    let (tx, rx) = mpsc::channel(inbox_capacity);
    let state = Arc::new(std::sync::Mutex::new(WorkerState::Initializing));
    let restarts = Arc::new(AtomicU32::new(0));

    let task = spawn_supervised(
        subscription_id,
        sink,
        rx,
        state.clone(),
        restarts.clone(),
        max_restarts,
        restart_window_secs,
    );

    SubscriptionWorkerHandle {
        inbox: tx,
        state,
        restarts,
        task,
    }
}

fn spawn_supervised(
    subscription_id: String,
    sink: Arc<dyn ChannelSink>,
    mut rx: mpsc::Receiver<OutboundEvent>,
    state: Arc<std::sync::Mutex<WorkerState>>,
    restarts: Arc<AtomicU32>,
    max_restarts: u32,
    restart_window_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        *state.lock().unwrap() = WorkerState::Active;
        let mut window_start = tokio::time::Instant::now();

        loop {
            let result = deliver_loop(&subscription_id, &sink, &mut rx).await;
            if matches!(*state.lock().unwrap(), WorkerState::Terminating) {
                return;
            }
            match result {
                WorkerExit::InboxClosed => {
                    *state.lock().unwrap() = WorkerState::Terminating;
                    debug!("subscription {subscription_id}: inbox closed, worker exiting");
                    return;
                }
                WorkerExit::Panicked => {
                    if window_start.elapsed().as_secs() > restart_window_secs {
                        restarts.store(0, Ordering::Relaxed);
                        window_start = tokio::time::Instant::now();
                    }
                    let count = restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    if count > max_restarts {
                        error!(
                            "subscription {subscription_id}: exceeded {max_restarts} restarts in \
                             {restart_window_secs}s, giving up"
                        );
                        *state.lock().unwrap() = WorkerState::Terminating;
                        return;
                    }
                    warn!("subscription {subscription_id}: delivery task panicked, restarting ({count}/{max_restarts})");
                }
            }
        }
    })
}

enum WorkerExit {
    InboxClosed,
    Panicked,
}

/// Runs the inbox drain loop inside `catch_unwind` so a panicking sink
/// implementation surfaces as a restart instead of unwinding the whole
/// supervised task.
async fn deliver_loop(subscription_id: &str, sink: &Arc<dyn ChannelSink>, rx: &mut mpsc::Receiver<OutboundEvent>) -> WorkerExit {
    loop {
        let Some(event) = rx.recv().await else {
            return WorkerExit::InboxClosed;
        };
        let sink = sink.clone();
        let outcome = std::panic::AssertUnwindSafe(async { sink.send(event) })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("subscription {subscription_id}: sink closed");
            }
            Err(_) => return WorkerExit::Panicked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingSink;

    #[tokio::test]
    async fn delivered_events_reach_the_sink_in_order() {
        let sink = Arc::new(RecordingSink::new());
        let handle = spawn("sub-1".to_string(), sink.clone(), 16, 5, 30);

        handle.inbox.send(OutboundEvent::KillmailCount { system_id: 1, count: 1 }).await.unwrap();
        handle.inbox.send(OutboundEvent::KillmailCount { system_id: 1, count: 2 }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(sink.drain().len(), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn stop_transitions_to_terminating() {
        let sink = Arc::new(RecordingSink::new());
        let handle = spawn("sub-1".to_string(), sink, 16, 5, 30);
        assert_eq!(handle.state(), WorkerState::Active);
        handle.stop();
        assert_eq!(handle.state(), WorkerState::Terminating);
    }
}
