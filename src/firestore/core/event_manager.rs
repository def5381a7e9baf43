//! Fans view snapshots out to query listeners.
//!
//! Several listeners on the same query share one view in the sync engine.
//! Each listener filters the shared snapshots according to its
//! [`ListenOptions`] and decides when its first snapshot may be raised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::remote::online_state_tracker::OnlineState;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change `from_cache` or
    /// `has_pending_writes`.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while online until the backend has
    /// confirmed the results.
    pub wait_for_sync_when_online: bool,
}

/// A single subscriber of a query. Snapshots and the terminal error are
/// pushed into a channel whose receiving side the caller holds.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    sink: Sender<FirestoreResult<ViewSnapshot>>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions) -> (Self, Receiver<FirestoreResult<ViewSnapshot>>) {
        let (sink, receiver) = async_channel::unbounded();
        let listener = Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            query,
            options,
            sink,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        };
        (listener, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether a snapshot was raised.
    pub fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot) -> bool {
        if !self.options.include_metadata_changes {
            snapshot
                .changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.emit(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: FirestoreError) {
        self.emit(Err(error));
        self.sink.close();
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        // Wait for the backend unless it is known to be unreachable.
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.emit(Ok(initial));
    }

    fn emit(&self, item: FirestoreResult<ViewSnapshot>) {
        if self.sink.try_send(item).is_err() {
            log::debug!("dropping snapshot for closed listener {}", self.id);
        }
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    /// Creates the manager and registers it as the sync engine's listener.
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: Arc::clone(&sync_engine),
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
        });
        let weak = Arc::downgrade(&manager);
        sync_engine.set_listener(weak);
        manager
    }

    fn state(&self) -> FirestoreResult<MutexGuard<'_, EventManagerState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("event manager lock poisoned"))
    }

    /// Adds `listener`. The first listener of a query registers it with the
    /// sync engine. Must run on the async queue.
    pub async fn listen(&self, mut listener: QueryListener) -> FirestoreResult<()> {
        let canonical_id = listener.query.canonical_id();
        let first_listen = !self.state()?.queries.contains_key(&canonical_id);

        let initial = if first_listen {
            match self.sync_engine.listen(listener.query.clone(), true).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::warn!("failed to initialize query {canonical_id}: {err}");
                    listener.on_error(err.clone());
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut state = self.state()?;
        let online_state = state.online_state;
        let info = state
            .queries
            .entry(canonical_id)
            .or_insert_with(|| QueryListenersInfo {
                view_snapshot: None,
                listeners: Vec::new(),
            });
        if initial.is_some() {
            info.view_snapshot = initial;
        }
        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = info.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        info.listeners.push(listener);
        Ok(())
    }

    /// Removes the listener with `listener_id`. The last listener of a query
    /// releases it in the sync engine.
    pub async fn unlisten(&self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let last_listen = {
            let mut state = self.state()?;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|listener| listener.id != listener_id);
            if info.listeners.len() == before {
                return Ok(());
            }
            let last_listen = info.listeners.is_empty();
            if last_listen {
                state.queries.remove(&canonical_id);
            }
            last_listen
        };
        if last_listen {
            self.sync_engine.unlisten(query.clone(), true).await?;
        }
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.state()
            .map(|state| state.queries.values().map(|info| info.listeners.len()).sum())
            .unwrap_or(0)
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let Ok(mut state) = self.state() else {
            return;
        };
        for snapshot in snapshots {
            let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let Ok(mut state) = self.state() else {
            return;
        };
        if let Some(info) = state.queries.remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let Ok(mut state) = self.state() else {
            return;
        };
        state.online_state = online_state;
        for info in state.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentSet;
    use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
    }

    fn snapshot(from_cache: bool, paths: &[&str], sync_state_changed: bool) -> ViewSnapshot {
        let query = rooms();
        let mut documents = DocumentSet::new(&query);
        for path in paths {
            documents.insert(MutableDocument::new_found_document(
                DocumentKey::from_string(path).unwrap(),
                Timestamp::new(1, 0),
                MapValue::empty(),
            ));
        }
        let mut snapshot =
            ViewSnapshot::from_initial_documents(query, documents, BTreeSet::new(), from_cache, false);
        snapshot.sync_state_changed = sync_state_changed;
        snapshot
    }

    #[test]
    fn empty_cached_result_waits_for_backend_or_offline() {
        let (mut listener, receiver) = QueryListener::new(rooms(), ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot(true, &[], true)));
        assert!(receiver.try_recv().is_err());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let raised = receiver.try_recv().unwrap().unwrap();
        assert!(raised.from_cache);
        assert!(raised.documents.is_empty());
    }

    #[test]
    fn wait_for_sync_holds_cached_documents_while_online() {
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let (mut listener, receiver) = QueryListener::new(rooms(), options);
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(snapshot(true, &["rooms/a"], true)));
        assert!(listener.on_view_snapshot(snapshot(false, &["rooms/a"], true)));
        assert!(!receiver.try_recv().unwrap().unwrap().from_cache);
    }

    #[test]
    fn metadata_only_snapshots_need_opt_in() {
        let (mut plain, plain_rx) = QueryListener::new(rooms(), ListenOptions::default());
        let (mut verbose, verbose_rx) = QueryListener::new(
            rooms(),
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
        );
        for listener in [&mut plain, &mut verbose] {
            assert!(listener.on_view_snapshot(snapshot(true, &["rooms/a"], true)));
        }
        let mut synced = snapshot(false, &["rooms/a"], true);
        synced.changes.clear();
        assert!(!plain.on_view_snapshot(synced.clone()));
        assert!(verbose.on_view_snapshot(synced));
        assert_eq!(plain_rx.len(), 1);
        assert_eq!(verbose_rx.len(), 2);
    }

    #[test]
    fn error_closes_the_stream() {
        let (listener, receiver) = QueryListener::new(rooms(), ListenOptions::default());
        listener.on_error(crate::firestore::error::permission_denied("denied"));
        assert!(receiver.try_recv().unwrap().is_err());
        assert!(receiver.is_closed());
    }
}
