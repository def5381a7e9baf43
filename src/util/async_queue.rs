use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{cancelled, failed_precondition, FirestoreResult};
use crate::platform::runtime;

/// Identifies the kind of a delayed operation so tests can fast-forward it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delays_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    IndexBackfill,
}

type Job = BoxFuture<'static, ()>;
type JobFactory = Box<dyn FnOnce() -> Job + Send>;

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    job: JobFactory,
}

#[derive(Default)]
struct QueueState {
    restricted: bool,
    delayed: Vec<DelayedEntry>,
}

struct QueueInner {
    sender: Sender<Job>,
    state: Mutex<QueueState>,
    next_delayed_id: AtomicU64,
}

impl QueueInner {
    fn push(&self, job: Job, even_while_restricted: bool) -> FirestoreResult<()> {
        {
            let state = self
                .state
                .lock()
                .map_err(|_| failed_precondition("async queue lock poisoned"))?;
            if state.restricted && !even_while_restricted {
                return Err(failed_precondition("The client has already been terminated."));
            }
        }
        self.sender
            .try_send(job)
            .map_err(|_| failed_precondition("async queue worker has stopped"))
    }

    fn take_delayed(&self, id: u64) -> Option<DelayedEntry> {
        let mut state = self.state.lock().ok()?;
        let position = state.delayed.iter().position(|entry| entry.id == id)?;
        Some(state.delayed.remove(position))
    }

    fn fire(&self, id: u64) {
        if let Some(entry) = self.take_delayed(id) {
            log::debug!("running delayed operation {:?}", entry.timer_id);
            if let Err(err) = self.push((entry.job)(), false) {
                log::debug!("dropping delayed operation {:?}: {err}", entry.timer_id);
            }
        }
    }
}

/// Serial executor. Operations run one at a time in the order they were
/// enqueued, each to completion, so state touched only from queued
/// operations needs no further coordination.
///
/// An operation must never await another operation enqueued on the same
/// queue; it would wait for itself.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    /// Starts the worker task on the current runtime.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(Self::run_worker(receiver));
        Self {
            inner: Arc::new(QueueInner {
                sender,
                state: Mutex::new(QueueState::default()),
                next_delayed_id: AtomicU64::new(1),
            }),
        }
    }

    async fn run_worker(receiver: Receiver<Job>) {
        while let Ok(job) = receiver.recv().await {
            job.await;
        }
        log::debug!("async queue worker exiting");
    }

    /// Schedules `op` and resolves with its result.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_internal(op, false)
    }

    /// Like [`AsyncQueue::enqueue`] but accepted after the queue entered
    /// restricted mode. Used for the shutdown sequence itself.
    pub fn enqueue_even_while_restricted<F, Fut, T>(
        &self,
        op: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_internal(op, true)
    }

    fn enqueue_internal<F, Fut, T>(
        &self,
        op: F,
        even_while_restricted: bool,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(op().await);
        }
        .boxed();
        let accepted = self.inner.push(job, even_while_restricted);
        async move {
            accepted?;
            rx.await
                .map_err(|_| cancelled("queued operation was dropped before completing"))?
        }
    }

    /// Schedules `op` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let job = async move {
            if let Err(err) = op().await {
                log::warn!("async queue operation failed: {err}");
            }
        }
        .boxed();
        if let Err(err) = self.inner.push(job, false) {
            log::debug!("operation not scheduled: {err}");
        }
    }

    /// Runs `op` on the queue once `delay` has elapsed unless cancelled first.
    pub fn enqueue_after_delay<F, Fut>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let job: JobFactory = Box::new(move || {
            async move {
                if let Err(err) = op().await {
                    log::warn!("delayed operation {timer_id:?} failed: {err}");
                }
            }
            .boxed()
        });
        if let Ok(mut state) = self.inner.state.lock() {
            state.delayed.push(DelayedEntry {
                id,
                timer_id,
                target_time: Instant::now() + delay,
                job,
            });
        }

        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.delayed.iter().any(|entry| entry.timer_id == timer_id))
            .unwrap_or(false)
    }

    /// Runs every delayed operation scheduled up to and including the last
    /// one with `last_timer_id`, in target-time order, then waits for them.
    pub async fn run_delays_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let due = {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| failed_precondition("async queue lock poisoned"))?;
            state.delayed.sort_by_key(|entry| entry.target_time);
            let cutoff = if last_timer_id == TimerId::All {
                state.delayed.len()
            } else {
                state
                    .delayed
                    .iter()
                    .rposition(|entry| entry.timer_id == last_timer_id)
                    .map(|index| index + 1)
                    .unwrap_or(0)
            };
            state.delayed.drain(..cutoff).collect::<Vec<_>>()
        };
        for entry in due {
            self.inner.push((entry.job)(), true)?;
        }
        self.enqueue_even_while_restricted(|| async { Ok(()) }).await
    }

    /// Rejects further operations; already queued ones still run.
    pub fn enter_restricted_mode(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.restricted = true;
            state.delayed.clear();
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.restricted)
            .unwrap_or(true)
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Debug)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<QueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. No effect once it has started.
    pub fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            if queue.take_delayed(self.id).is_some() {
                log::debug!("cancelled delayed operation {:?}", self.timer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn operations_run_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(move || async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        let value = queue.enqueue(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_operations_can_be_fast_forwarded_or_cancelled() {
        let queue = AsyncQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let first = {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), move || async move {
                log.lock().unwrap().push("idle");
                Ok(())
            })
        };
        let second = {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(300), move || async move {
                log.lock().unwrap().push("gc");
                Ok(())
            })
        };
        second.cancel();
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue.run_delays_until(TimerId::All).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["idle"]);
        first.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test]
    async fn restricted_queue_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        assert!(queue.enqueue(|| async { Ok(()) }).await.is_err());
        assert!(queue.enqueue_even_while_restricted(|| async { Ok(1) }).await.is_ok());
    }
}
