//! C4 — request coalescing: concurrent identical fetches share one upstream
//! call. Same single-flight shape as `Cache::get_or_compute` (C1), but keyed
//! on the request itself rather than a cache namespace, and abandoned after
//! `coalesce_timeout_ms` with no cached value left behind on success.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoalesceError<E> {
    #[error("coalesced request abandoned after timeout")]
    Abandoned,
    #[error(transparent)]
    Inner(E),
}

type ResultBroadcast<T, E> = broadcast::Sender<Result<T, E>>;

pub struct Coalescer<T, E> {
    inflight: DashMap<String, ResultBroadcast<T, E>>,
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Coalescer {
            inflight: DashMap::new(),
        }
    }

    /// Runs `f` for `key` once across every concurrent caller; followers
    /// receive a clone of the leader's result. A follower waiting past
    /// `timeout` gives up with `CoalesceError::Abandoned` without affecting
    /// the leader, which keeps running to completion regardless.
    pub async fn coalesce<F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, CoalesceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (became_leader, channel) = {
            let mut became_leader = false;
            let entry = self.inflight.entry(key.to_string()).or_insert_with(|| {
                became_leader = true;
                broadcast::channel(1).0
            });
            (became_leader, entry.clone())
        };

        if became_leader {
            let result = f().await;
            self.inflight.remove(key);
            let _ = channel.send(result.clone());
            result.map_err(CoalesceError::Inner)
        } else {
            let mut rx = channel.subscribe();
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Ok(result)) => result.map_err(CoalesceError::Inner),
                Ok(Err(_)) => Err(CoalesceError::Abandoned),
                Err(_) => Err(CoalesceError::Abandoned),
            }
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

pub type SharedCoalescer<T, E> = Arc<Coalescer<T, E>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn concurrent_identical_keys_share_one_upstream_call() {
        let coalescer = Arc::new(Coalescer::<String, String>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .coalesce("zkb:12345", Duration::from_secs(5), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>("killmail body".to_string())
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "killmail body");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_each_run_their_own_call() {
        let coalescer = Arc::new(Coalescer::<i32, String>::new());
        let calls = Arc::new(AtomicU32::new(0));

        for key in ["a", "b", "c"] {
            let calls = calls.clone();
            let result = coalescer
                .coalesce(key, Duration::from_secs(5), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(1)
                })
                .await;
            assert_eq!(result.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn follower_past_timeout_is_abandoned_without_affecting_leader() {
        let coalescer = Arc::new(Coalescer::<i32, String>::new());
        let coalescer2 = coalescer.clone();

        let leader = tokio::spawn(async move {
            coalescer2
                .coalesce("slow", Duration::from_secs(5), || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(7)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = coalescer
            .coalesce("slow", Duration::from_millis(20), || async move {
                unreachable!("follower must not run its own closure")
            })
            .await;

        assert!(matches!(follower, Err(CoalesceError::Abandoned)));
        assert_eq!(leader.await.unwrap().unwrap(), 7);
    }
}
