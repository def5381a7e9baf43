use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::firestore::error::FirestoreResult;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60 * 1_000);

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Retry helper for stream reconnects. The first attempt after a reset runs
/// immediately; later ones wait the current base delay plus up to half of it
/// in either direction, measured from the start of the previous attempt.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    config: BackoffConfig,
    current_base_millis: f64,
    last_attempt: Arc<Mutex<Instant>>,
    pending: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId) -> Self {
        Self::with_config(queue, timer_id, BackoffConfig::default())
    }

    pub fn with_config(queue: AsyncQueue, timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            queue,
            timer_id,
            config,
            current_base_millis: 0.0,
            last_attempt: Arc::new(Mutex::new(Instant::now())),
            pending: None,
        }
    }

    /// The next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// The next attempt waits the maximum delay. Used after quota errors.
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay.as_millis() as f64;
    }

    /// Schedules `op` on the queue after the current delay and grows the
    /// delay for the attempt after it. Cancels any attempt still pending.
    pub fn backoff_and_run<F, Fut>(&mut self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        self.backoff_and_run_with_rng(op, &mut rand::thread_rng());
    }

    fn backoff_and_run_with_rng<F, Fut, R>(&mut self, op: F, rng: &mut R)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
        R: Rng + ?Sized,
    {
        self.cancel();

        let remaining = self.remaining_delay(rng);
        if !remaining.is_zero() {
            log::debug!(
                "backing off for {} ms (base delay {} ms)",
                remaining.as_millis(),
                self.current_base_millis as u64
            );
        }

        let last_attempt = Arc::clone(&self.last_attempt);
        self.pending = Some(self.queue.enqueue_after_delay(self.timer_id, remaining, move || {
            if let Ok(mut last) = last_attempt.lock() {
                *last = Instant::now();
            }
            op()
        }));

        let initial = self.config.initial_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        self.current_base_millis = (self.current_base_millis * self.config.backoff_factor).clamp(initial, max);
    }

    fn remaining_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = (rng.gen::<f64>() - 0.5) * self.current_base_millis;
        let desired = (self.current_base_millis + jitter).floor().max(0.0);
        let elapsed = self
            .last_attempt
            .lock()
            .map(|last| last.elapsed().as_millis() as f64)
            .unwrap_or(0.0);
        Duration::from_millis((desired - elapsed).max(0.0) as u64)
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    pub fn current_base_delay(&self) -> Duration {
        Duration::from_millis(self.current_base_millis as u64)
    }
}
