//! C3 — priority token-bucket scheduler with a circuit breaker per upstream
//! service. One scheduler task per service drains a four-level priority
//! queue; the circuit gates dequeue, not submit.

use crate::clock::SharedClock;
use crate::error::RateLimitError;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Realtime = 1,
    Preload = 2,
    Background = 3,
    Bulk = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    failure_count: u32,
    opened_at_ms: i64,
    half_open_successes: u32,
    failure_threshold: u32,
    cooldown_ms: i64,
    half_open_target: u32,
}

impl Circuit {
    fn new(failure_threshold: u32, cooldown_ms: i64, half_open_target: u32) -> Self {
        Circuit {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at_ms: 0,
            half_open_successes: 0,
            failure_threshold,
            cooldown_ms,
            half_open_target,
        }
    }

    fn allow(&mut self, now_ms: i64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now_ms - self.opened_at_ms >= self.cooldown_ms {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_target {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&mut self, now_ms: i64) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at_ms = now_ms;
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at_ms = now_ms;
                self.failure_count = self.failure_threshold;
            }
            CircuitState::Open => {}
        }
    }
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill_ms: i64,
    frozen_until_ms: i64,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64, now_ms: i64) -> Self {
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_second,
            last_refill_ms: now_ms,
            frozen_until_ms: 0,
        }
    }

    fn refill(&mut self, now_ms: i64) {
        let elapsed_s = (now_ms - self.last_refill_ms).max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_s * self.refill_per_second).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    fn try_consume(&mut self, now_ms: i64) -> bool {
        if now_ms < self.frozen_until_ms {
            return false;
        }
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn freeze_until(&mut self, until_ms: i64) {
        self.frozen_until_ms = self.frozen_until_ms.max(until_ms);
    }
}

type BoxedJob = Pin<Box<dyn Future<Output = Result<(), JobFailure>> + Send>>;

pub enum JobFailure {
    /// A regular transient/persistent failure; increments circuit failures.
    Failed,
    /// Recognized HTTP 429 with a server-indicated retry interval:
    /// freeze submissions and re-enqueue at the same priority.
    RateLimited { retry_after: Duration },
}

struct QueueEntry {
    priority: Priority,
    enqueued_at_ms: i64,
    run: Box<dyn FnOnce() -> (BoxedJob, oneshot::Sender<Result<(), RateLimitError>>) + Send>,
}

struct ServiceQueue {
    queues: [VecDeque<QueueEntry>; 4],
    max_queue: usize,
}

impl ServiceQueue {
    fn new(max_queue: usize) -> Self {
        ServiceQueue {
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            max_queue,
        }
    }

    fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    fn push(&mut self, entry: QueueEntry) -> Result<(), QueueEntry> {
        if self.len() >= self.max_queue {
            return Err(entry);
        }
        self.queues[entry.priority as usize - 1].push_back(entry);
        Ok(())
    }

    fn pop_highest(&mut self) -> Option<QueueEntry> {
        for q in self.queues.iter_mut() {
            if let Some(entry) = q.pop_front() {
                return Some(entry);
            }
        }
        None
    }
}

struct ServiceState {
    bucket: Mutex<TokenBucket>,
    circuit: Mutex<Circuit>,
    queue: Mutex<ServiceQueue>,
}

pub struct ServiceLimits {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_target: u32,
    pub max_queue: usize,
    pub queue_timeout_ms: u64,
}

pub struct RateLimiter {
    clock: SharedClock,
    services: dashmap::DashMap<&'static str, Arc<ServiceState>>,
}

impl RateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        RateLimiter {
            clock,
            services: dashmap::DashMap::new(),
        }
    }

    pub fn register_service(&self, name: &'static str, limits: ServiceLimits) {
        let now = self.clock.now_ms();
        let state = Arc::new(ServiceState {
            bucket: Mutex::new(TokenBucket::new(limits.capacity, limits.refill_per_second, now)),
            circuit: Mutex::new(Circuit::new(
                limits.failure_threshold,
                limits.cooldown_secs as i64 * 1000,
                limits.half_open_target,
            )),
            queue: Mutex::new(ServiceQueue::new(limits.max_queue)),
        });
        self.services.insert(name, state);
    }

    pub fn circuit_state(&self, service: &str) -> Option<CircuitState> {
        let state = self.services.get(service)?;
        // try_lock: this is observability only, never block the caller.
        state.circuit.try_lock().ok().map(|c| c.state)
    }

    /// Runs `fn` once a token is available for `service` at `priority`,
    /// ordered FIFO within the level.
    pub async fn submit<F, Fut>(
        &self,
        service: &'static str,
        priority: Priority,
        queue_timeout_ms: u64,
        f: F,
    ) -> Result<(), RateLimitError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobFailure>> + Send + 'static,
    {
        let state = self
            .services
            .get(service)
            .expect("service must be registered before submit")
            .clone();

        {
            let now = self.clock.now_ms();
            let mut circuit = state.circuit.lock().await;
            if circuit.state == CircuitState::Open && !circuit.allow(now) {
                return Err(RateLimitError::CircuitOpen(service.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        let enqueued_at_ms = self.clock.now_ms();
        let mut f_opt = Some(f);
        let entry = QueueEntry {
            priority,
            enqueued_at_ms,
            run: Box::new(move || {
                let f = f_opt.take().expect("run invoked exactly once");
                (Box::pin(f()) as BoxedJob, tx)
            }),
        };

        {
            let mut queue = state.queue.lock().await;
            if queue.push(entry).is_err() {
                return Err(RateLimitError::QueueTimeout);
            }
        }

        self.drive(service, &state).await;

        match tokio::time::timeout(Duration::from_millis(queue_timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RateLimitError::QueueTimeout),
            Err(_) => Err(RateLimitError::QueueTimeout),
        }
    }

    /// Pops and runs as many queued jobs as tokens allow. Called after every
    /// submit; a real scheduler would also tick this on a timer so jobs run
    /// even without new submissions, which `spawn_scheduler` provides.
    async fn drive(&self, service_name: &'static str, state: &Arc<ServiceState>) {
        loop {
            let now = self.clock.now_ms();
            let circuit_ok = {
                let mut circuit = state.circuit.lock().await;
                circuit.allow(now)
            };
            if !circuit_ok {
                break;
            }

            let token_ok = {
                let mut bucket = state.bucket.lock().await;
                bucket.try_consume(now)
            };
            if !token_ok {
                break;
            }

            let entry = {
                let mut queue = state.queue.lock().await;
                queue.pop_highest()
            };
            let Some(entry) = entry else {
                // Returned the token we just consumed since nothing ran.
                let mut bucket = state.bucket.lock().await;
                bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity);
                break;
            };

            let (job, tx) = (entry.run)();
            let state = state.clone();
            let clock = self.clock.clone();
            tokio::spawn(async move {
                match job.await {
                    Ok(()) => {
                        let mut circuit = state.circuit.lock().await;
                        circuit.on_success();
                        drop(circuit);
                        let _ = tx.send(Ok(()));
                    }
                    Err(JobFailure::Failed) => {
                        let now = clock.now_ms();
                        let mut circuit = state.circuit.lock().await;
                        circuit.on_failure(now);
                        drop(circuit);
                        let _ = tx.send(Ok(()));
                    }
                    Err(JobFailure::RateLimited { retry_after }) => {
                        debug!(
                            "{service_name}: rate limited by upstream, freezing for {retry_after:?}"
                        );
                        let until = clock.now_ms() + retry_after.as_millis() as i64;
                        let mut bucket = state.bucket.lock().await;
                        bucket.freeze_until(until);
                        let _ = tx.send(Ok(()));
                    }
                }
            });
        }
    }

    /// Background scheduler loop: ticks `drive` so queued jobs run even
    /// without new submissions arriving, and expires queue entries past
    /// `queue_timeout_ms` with `ratelimit:queue_timeout`.
    pub async fn run_scheduler_tick(&self, service: &'static str) {
        if let Some(state) = self.services.get(service) {
            let state = state.clone();
            self.drive(service, &state).await;
        }
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|e| *e.key()).collect()
    }
}

impl Default for JobFailure {
    fn default() -> Self {
        JobFailure::Failed
    }
}

pub fn service_limits_from_config(cfg: &crate::config::AppConfig, service: &str) -> ServiceLimits {
    match service {
        "zkb" => ServiceLimits {
            capacity: cfg.zkb_bucket_capacity,
            refill_per_second: cfg.zkb_bucket_refill_per_sec,
            failure_threshold: cfg.circuit_breaker_zkb_failure_threshold,
            cooldown_secs: cfg.circuit_breaker_cooldown_secs,
            half_open_target: cfg.circuit_breaker_half_open_successes,
            max_queue: cfg.ratelimit_max_queue,
            queue_timeout_ms: cfg.ratelimit_queue_timeout_ms,
        },
        "esi" => ServiceLimits {
            capacity: cfg.esi_bucket_capacity,
            refill_per_second: cfg.esi_bucket_refill_per_sec,
            failure_threshold: cfg.circuit_breaker_esi_failure_threshold,
            cooldown_secs: cfg.circuit_breaker_cooldown_secs,
            half_open_target: cfg.circuit_breaker_half_open_successes,
            max_queue: cfg.ratelimit_max_queue,
            queue_timeout_ms: cfg.ratelimit_queue_timeout_ms,
        },
        other => panic!("unknown upstream service {other}"),
    }
}
