use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::firestore::error::FirestoreError;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Failed connection attempts, counted while not online, before the client
/// reports itself offline. A failure of an established stream is not counted:
/// it only drops the state to `Unknown`, so one dropped connection never
/// surfaces as offline unless the reconnect fails too.
const MAX_WATCH_STREAM_FAILURES: usize = 1;

/// How long a connection attempt may take before the client is reported
/// offline.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has finished yet. Views stay in their current
    /// cache state.
    Unknown,
    Online,
    /// Views are raised as `from_cache` and pending writes are not retried
    /// eagerly.
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: usize,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: Mutex<TrackerState>,
}

/// Derives the aggregate [`OnlineState`] from watch stream health.
///
/// The state starts `Unknown`. It becomes `Offline` after a watch stream
/// failure or once a connection attempt has been pending for
/// [`ONLINE_STATE_TIMEOUT`]; the remote store sets `Online` on the first
/// message from the backend.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                state: Mutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    online_state_timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.inner
            .lock()
            .map(|state| state.state)
            .unwrap_or(OnlineState::Unknown)
    }

    /// Called whenever the watch stream starts connecting. Arms the timeout
    /// unless a failure was already counted.
    pub fn handle_watch_stream_start(&self) {
        let changed = {
            let Some(mut state) = self.inner.lock() else {
                return;
            };
            if state.watch_stream_failures != 0 {
                return;
            }
            let changed = TrackerInner::transition(&mut state, OnlineState::Unknown);
            let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
            state.online_state_timer = Some(self.inner.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                ONLINE_STATE_TIMEOUT,
                move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_timeout();
                    }
                    Ok(())
                },
            ));
            changed
        };
        if changed {
            (self.inner.handler)(OnlineState::Unknown);
        }
    }

    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let changed = {
            let Some(mut state) = self.inner.lock() else {
                return;
            };
            if state.state == OnlineState::Online {
                TrackerInner::transition(&mut state, OnlineState::Unknown).then_some(OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.online_state_timer.take() {
                        timer.cancel();
                    }
                    let reason = match error {
                        Some(err) => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {err}"),
                        None => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times"),
                    };
                    TrackerInner::warn_offline(&mut state, &reason);
                    TrackerInner::transition(&mut state, OnlineState::Offline).then_some(OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        if let Some(new_state) = changed {
            (self.inner.handler)(new_state);
        }
    }

    /// Explicit transition from the remote store. Clears the failure count
    /// and any pending timeout.
    pub fn set(&self, new_state: OnlineState) {
        let changed = {
            let Some(mut state) = self.inner.lock() else {
                return;
            };
            if let Some(timer) = state.online_state_timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
            TrackerInner::transition(&mut state, new_state)
        };
        if changed {
            (self.inner.handler)(new_state);
        }
    }
}

impl TrackerInner {
    fn lock(&self) -> Option<MutexGuard<'_, TrackerState>> {
        match self.state.lock() {
            Ok(state) => Some(state),
            Err(_) => {
                log::error!("online state lock poisoned");
                None
            }
        }
    }

    fn transition(state: &mut TrackerState, new_state: OnlineState) -> bool {
        if state.state == new_state {
            return false;
        }
        log::debug!("online state {:?} -> {new_state:?}", state.state);
        state.state = new_state;
        true
    }

    fn warn_offline(state: &mut TrackerState, reason: &str) {
        if state.should_warn_client_is_offline {
            log::warn!("Could not reach the backend. {reason}. The client will operate in offline mode until a connection succeeds.");
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{reason}");
        }
    }

    fn handle_timeout(&self) {
        let changed = {
            let Some(mut state) = self.lock() else {
                return;
            };
            state.online_state_timer = None;
            if state.state != OnlineState::Unknown {
                return;
            }
            let reason = format!("Backend didn't respond within {} seconds", ONLINE_STATE_TIMEOUT.as_secs());
            Self::warn_offline(&mut state, &reason);
            Self::transition(&mut state, OnlineState::Offline)
        };
        if changed {
            (self.handler)(OnlineState::Offline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker() -> (AsyncQueue, OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(queue.clone(), Arc::new(move |state| sink.lock().unwrap().push(state)));
        (queue, tracker, seen)
    }

    #[tokio::test]
    async fn timeout_reports_offline() {
        let (queue, tracker, seen) = tracker();
        let starter = tracker.clone();
        queue
            .enqueue(move || async move {
                starter.handle_watch_stream_start();
                Ok(())
            })
            .await
            .unwrap();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue.run_delays_until(TimerId::OnlineStateTimeout).await.unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn dropped_connection_needs_failed_reconnect_to_go_offline() {
        let (queue, tracker, seen) = tracker();
        let driver = tracker.clone();
        queue
            .enqueue(move || async move {
                driver.set(OnlineState::Online);
                driver.handle_watch_stream_failure(Some(&unavailable("reset by peer")));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Unknown);

        let driver = tracker.clone();
        queue
            .enqueue(move || async move {
                driver.handle_watch_stream_failure(Some(&unavailable("down")));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown, OnlineState::Offline]
        );
    }

    #[tokio::test]
    async fn first_failure_goes_offline_and_online_resets() {
        let (queue, tracker, seen) = tracker();
        let driver = tracker.clone();
        queue
            .enqueue(move || async move {
                driver.handle_watch_stream_start();
                driver.handle_watch_stream_failure(Some(&unavailable("down")));
                driver.set(OnlineState::Online);
                driver.handle_watch_stream_failure(None);
                Ok(())
            })
            .await
            .unwrap();
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Offline, OnlineState::Online, OnlineState::Unknown]
        );
    }
}
