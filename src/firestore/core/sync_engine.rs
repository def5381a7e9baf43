//! Coordinates the local store, the remote store and the query views.
//!
//! The sync engine owns one [`View`] per listened query, keeps the mapping
//! from targets to queries, resolves limbo documents through dedicated
//! document targets, and completes write callbacks once the backend has
//! acknowledged or rejected a batch. It is the [`RemoteSyncer`] of its
//! remote store, and it mirrors its activity to other contexts through the
//! [`SharedClientState`].
//!
//! State lives behind a synchronous mutex. Network calls and listener
//! notifications are collected while the lock is held and performed after it
//! is released.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, internal_error, is_primary_lease_lost, FirestoreError, FirestoreResult};
use crate::firestore::local::local_store::{DocumentMap, LocalStore, LocalViewChanges};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{
    MutationBatchState, MutationBatchStatus, QueryTargetStatus, SharedClientEnvelope, SharedClientMessage,
    SharedClientState,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, MutableDocument, Mutation, MutationBatchResult, Timestamp, User, BATCH_ID_UNKNOWN,
    INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffConfig;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Receives the output of the sync engine. Implemented by the event
/// manager.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query's target was rejected; the query is no longer listened to.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;
type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has reported the document. Until it does,
    /// the key is not part of the target's remote keys.
    received_document: bool,
}

enum RemoteAction {
    Listen(TargetData),
    Unlisten(i32),
}

/// Side effects collected under the state lock.
#[derive(Default)]
struct Effects {
    snapshots: Vec<ViewSnapshot>,
    errors: Vec<(Query, FirestoreError)>,
    remote: Vec<RemoteAction>,
}

struct SyncEngineState {
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<i32, WriteCallback>>,
    /// Keyed by the highest batch id pending when the callback registered.
    pending_writes_callbacks: BTreeMap<i32, Vec<WriteCallback>>,
    current_user: User,
    online_state: OnlineState,
    /// Unset until the first lease check.
    is_primary: Option<bool>,
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<SharedClientState>,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_store: Arc<LocalStore>,
        network: NetworkLayer,
        serializer: JsonProtoSerializer,
        queue: AsyncQueue,
        shared_client_state: Arc<SharedClientState>,
        backoff: BackoffConfig,
        max_concurrent_limbo_resolutions: usize,
    ) -> FirestoreResult<Arc<Self>> {
        let current_user = local_store.current_user()?;
        Ok(Arc::new_cyclic(|weak: &Weak<SyncEngine>| {
            let syncer: Weak<dyn RemoteSyncer> = weak.clone();
            let remote_store = RemoteStore::new(
                Arc::clone(&local_store),
                network,
                serializer,
                queue,
                syncer,
                backoff,
            );
            SyncEngine {
                local_store,
                remote_store,
                shared_client_state,
                listener: Mutex::new(None),
                max_concurrent_limbo_resolutions: max_concurrent_limbo_resolutions.max(1),
                state: Mutex::new(SyncEngineState {
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                    mutation_user_callbacks: BTreeMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                    current_user,
                    online_state: OnlineState::Unknown,
                    is_primary: None,
                }),
            }
        }))
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        match self.listener.lock() {
            Ok(mut slot) => *slot = Some(listener),
            Err(_) => log::error!("sync engine listener lock poisoned"),
        }
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn shared_client_state(&self) -> &Arc<SharedClientState> {
        &self.shared_client_state
    }

    pub fn is_primary(&self) -> bool {
        self.state()
            .map(|state| state.is_primary == Some(true))
            .unwrap_or(false)
    }

    pub fn online_state(&self) -> OnlineState {
        self.state()
            .map(|state| state.online_state)
            .unwrap_or(OnlineState::Unknown)
    }

    /// Keys currently resolved through a limbo target.
    pub fn active_limbo_documents(&self) -> BTreeSet<DocumentKey> {
        self.state()
            .map(|state| state.active_limbo_targets_by_key.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys waiting for a free limbo resolution slot, oldest first.
    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.state()
            .map(|state| state.enqueued_limbo_resolutions.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn state(&self) -> FirestoreResult<MutexGuard<'_, SyncEngineState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("sync engine state lock poisoned"))
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }

    async fn flush(&self, effects: Effects) -> FirestoreResult<()> {
        let Effects {
            snapshots,
            errors,
            remote,
        } = effects;
        if !errors.is_empty() || !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                for (query, error) in errors {
                    listener.on_watch_error(&query, error);
                }
                if !snapshots.is_empty() {
                    listener.on_watch_change(snapshots);
                }
            }
        }
        for action in remote {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    /// Registers `query` and returns its first snapshot, computed from the
    /// local cache.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let mut effects = Effects::default();
        let (snapshot, remote_target) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            if let Some(query_view) = state.query_views.get(&canonical_id) {
                // The view survived an earlier unlisten because another
                // context still listens to its target.
                self.shared_client_state
                    .add_local_query_target(query_view.target_id, true)?;
                (query_view.view.compute_initial_snapshot(), None)
            } else {
                let target_data = self.local_store.allocate_target(query.to_target())?;
                let status = self
                    .shared_client_state
                    .add_local_query_target(target_data.target_id, should_listen_to_remote)?;
                let snapshot = self.initialize_view_and_compute_snapshot(
                    state,
                    query,
                    target_data.target_id,
                    status == QueryTargetStatus::Current,
                    &target_data.resume_token,
                    &mut effects,
                )?;
                let listen = state.is_primary == Some(true) && should_listen_to_remote;
                (snapshot, listen.then_some(target_data))
            }
        };
        self.flush(effects).await?;
        if let Some(target_data) = remote_target {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: i32,
        current: bool,
        resume_token: &[u8],
        effects: &mut Effects,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = TargetChange {
            resume_token: resume_token.to_vec(),
            current: current && state.online_state != OnlineState::Offline,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(doc_changes, state.is_primary == Some(true), Some(&synthesized), false);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes, effects);

        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        view_change
            .snapshot
            .ok_or_else(|| internal_error("first view change produced no snapshot"))
    }

    /// Stops listening to `query`. The target is released once no query and
    /// no other context uses it.
    pub async fn unlisten(&self, query: Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let Some(target_id) = state.query_views.get(&canonical_id).map(|query_view| query_view.target_id) else {
                return Err(internal_error(format!("Trying to unlisten on query not found: {canonical_id}")));
            };
            if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
                if queries.len() > 1 {
                    queries.retain(|other| other.canonical_id() != canonical_id);
                    state.query_views.remove(&canonical_id);
                    return Ok(());
                }
            }

            if state.is_primary == Some(true) {
                self.shared_client_state.remove_local_query_target(target_id)?;
                if !self.shared_client_state.is_active_query_target(target_id)? {
                    match self.local_store.release_target(target_id, false) {
                        Ok(()) => {
                            self.shared_client_state.clear_query_state(target_id)?;
                            if should_unlisten_to_remote {
                                effects.remote.push(RemoteAction::Unlisten(target_id));
                            }
                            self.remove_and_cleanup_target(state, target_id, None, &mut effects)?;
                        }
                        Err(err) if is_primary_lease_lost(&err) => {
                            log::debug!("failed to release target {target_id}: {err}");
                        }
                        Err(err) => return Err(err),
                    }
                }
            } else {
                self.remove_and_cleanup_target(state, target_id, None, &mut effects)?;
                self.local_store.release_target(target_id, true)?;
            }
        }
        self.flush(effects).await
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// returned completion resolves once the batch is acknowledged or
    /// rejected.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let (callback, completion) = oneshot::channel();
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let result = self.local_store.local_write(mutations).map_err(|err| {
                log::warn!("dropping write that cannot be locally applied: {err}");
                err
            })?;
            let keys: BTreeSet<DocumentKey> = result.changes.keys().cloned().collect();
            self.shared_client_state.add_pending_mutation(result.batch_id, keys)?;
            state
                .mutation_user_callbacks
                .entry(state.current_user.to_key())
                .or_default()
                .insert(result.batch_id, callback);
            self.emit_new_snaps_and_notify_local_store(state, &result.changes, None, &mut effects)?;
        }
        self.flush(effects).await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok(completion)
    }

    /// Resolves once every batch pending at the time of the call has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> FirestoreResult<WriteCompletion> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "The network is disabled. Waiting for pending writes will not complete until the network is enabled."
            );
        }
        let (callback, completion) = oneshot::channel();
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
        } else {
            self.state()?
                .pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(callback);
        }
        Ok(completion)
    }

    /// Switches to primary or secondary mode. A new primary takes over every
    /// target active in any context; a demoted one keeps only its own views
    /// and stops the network.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let was_primary = self.state()?.is_primary;
        if is_primary && was_primary != Some(true) {
            let active_targets = self.shared_client_state.get_all_active_query_targets()?;
            let mut effects = Effects::default();
            let targets = {
                let mut guard = self.state()?;
                let state = &mut *guard;
                state.is_primary = Some(true);
                self.synchronize_query_views_and_raise_snapshots(state, active_targets, true, &mut effects)?
            };
            self.flush(effects).await?;
            self.remote_store.apply_primary_state(true).await?;
            for target_data in targets {
                self.remote_store.listen(target_data).await?;
            }
            self.remote_store.fill_write_pipeline().await?;
        } else if !is_primary && was_primary != Some(false) {
            let mut effects = Effects::default();
            {
                let mut guard = self.state()?;
                let state = &mut *guard;
                state.is_primary = Some(false);
                let target_ids: Vec<i32> = state.queries_by_target.keys().copied().collect();
                let mut local_targets = BTreeSet::new();
                for target_id in target_ids {
                    if self.shared_client_state.is_local_query_target(target_id)? {
                        local_targets.insert(target_id);
                    } else {
                        self.remove_and_cleanup_target(state, target_id, None, &mut effects)?;
                        self.local_store.release_target(target_id, true)?;
                    }
                    effects.remote.push(RemoteAction::Unlisten(target_id));
                }
                self.synchronize_query_views_and_raise_snapshots(state, local_targets, false, &mut effects)?;
                Self::reset_limbo_documents(state, &mut effects);
            }
            self.flush(effects).await?;
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Re-reads the views of `targets` from persistence, creating views for
    /// targets only another context listened to. Returns the target data to
    /// listen to.
    fn synchronize_query_views_and_raise_snapshots(
        &self,
        state: &mut SyncEngineState,
        targets: BTreeSet<i32>,
        transition_to_primary: bool,
        effects: &mut Effects,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active = Vec::new();
        for target_id in targets {
            let queries = state.queries_by_target.get(&target_id).cloned().unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let query_result = self.local_store.execute_query(query, true)?;
                    let view_change = query_view.view.synchronize_with_persisted_state(query_result);
                    let view_target = query_view.target_id;
                    if let Some(snapshot) = view_change.snapshot {
                        effects.snapshots.push(snapshot);
                    }
                    if transition_to_primary {
                        self.update_tracked_limbos(state, view_target, view_change.limbo_changes, effects);
                    }
                }
                target_data
            } else {
                let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                    log::debug!("no cached target {target_id} to synchronize");
                    continue;
                };
                let target_data = self.local_store.allocate_target(cached.target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    state,
                    Query::from_target(&cached.target),
                    target_id,
                    false,
                    &target_data.resume_token,
                    effects,
                )?;
                target_data
            };
            active.push(target_data);
        }
        Ok(active)
    }

    /// Handles a message from another context sharing the store.
    pub async fn handle_shared_client_message(&self, envelope: SharedClientEnvelope) -> FirestoreResult<()> {
        log::debug!("shared client message from {}", envelope.sender);
        match envelope.message {
            SharedClientMessage::MutationBatch(batch_state) => {
                if batch_state.user != self.state()?.current_user {
                    return Ok(());
                }
                self.apply_batch_state(batch_state).await
            }
            SharedClientMessage::QueryTarget(target_state) => {
                self.apply_target_state(target_state.target_id, target_state.status, target_state.error)
                    .await
            }
            SharedClientMessage::OnlineState(online_state) => {
                if !self.is_primary() {
                    self.apply_online_state(online_state);
                }
                Ok(())
            }
            SharedClientMessage::Client {
                added_target_ids,
                removed_target_ids,
                ..
            } => {
                self.apply_active_targets_change(added_target_ids, removed_target_ids)
                    .await
            }
        }
    }

    async fn apply_batch_state(&self, batch_state: MutationBatchState) -> FirestoreResult<()> {
        let MutationBatchState {
            batch_id,
            status,
            error,
            keys,
            ..
        } = batch_state;
        let documents = match self.local_store.lookup_mutation_documents(batch_id)? {
            Some(documents) => documents,
            None if keys.is_empty() => {
                log::debug!("Cannot apply mutation batch with id: {batch_id}");
                return Ok(());
            }
            None => {
                let mut documents = DocumentMap::new();
                for key in keys {
                    let document = self.local_store.read_document(&key)?;
                    documents.insert(key, document);
                }
                documents
            }
        };

        let mut effects = Effects::default();
        let fill_pipeline = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let fill_pipeline = match status {
                MutationBatchStatus::Pending => state.is_primary == Some(true),
                MutationBatchStatus::Acknowledged | MutationBatchStatus::Rejected => {
                    Self::process_user_callback(state, batch_id, error);
                    Self::trigger_pending_writes_callbacks(state, batch_id);
                    false
                }
            };
            self.emit_new_snaps_and_notify_local_store(state, &documents, None, &mut effects)?;
            fill_pipeline
        };
        self.flush(effects).await?;
        if fill_pipeline {
            self.remote_store.fill_write_pipeline().await?;
        }
        Ok(())
    }

    /// A secondary learns that the primary updated a target it listens to.
    async fn apply_target_state(
        &self,
        target_id: i32,
        status: QueryTargetStatus,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary() {
            log::debug!("Ignoring unexpected query state notification.");
            return Ok(());
        }
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let Some(queries) = state.queries_by_target.get(&target_id).cloned() else {
                return Ok(());
            };
            match status {
                QueryTargetStatus::Current | QueryTargetStatus::NotCurrent => {
                    // Documents may have changed anywhere in the shared store;
                    // reread the query results and the documents the views
                    // currently show.
                    let mut changes = DocumentMap::new();
                    for query in &queries {
                        changes.extend(self.local_store.execute_query(query, false)?.documents);
                        if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                            for key in query_view.view.document_keys() {
                                if !changes.contains_key(&key) {
                                    let document = self.local_store.read_document(&key)?;
                                    changes.insert(key, document);
                                }
                            }
                        }
                    }
                    let mut event = RemoteEvent {
                        snapshot_version: Timestamp::MIN,
                        ..RemoteEvent::default()
                    };
                    event.target_changes.insert(
                        target_id,
                        TargetChange {
                            current: status == QueryTargetStatus::Current,
                            ..TargetChange::default()
                        },
                    );
                    self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event), &mut effects)?;
                }
                QueryTargetStatus::Rejected => {
                    self.local_store.release_target(target_id, true)?;
                    let error = error.unwrap_or_else(|| internal_error(format!("target {target_id} was rejected")));
                    self.remove_and_cleanup_target(state, target_id, Some(error), &mut effects)?;
                }
            }
        }
        self.flush(effects).await
    }

    /// The primary takes over targets that other contexts started or
    /// stopped listening to.
    async fn apply_active_targets_change(&self, added: BTreeSet<i32>, removed: BTreeSet<i32>) -> FirestoreResult<()> {
        if !self.is_primary() {
            return Ok(());
        }
        for target_id in added {
            let mut effects = Effects::default();
            let target_data = {
                let mut guard = self.state()?;
                let state = &mut *guard;
                if state.queries_by_target.contains_key(&target_id) {
                    log::debug!("Adding an already active target {target_id}");
                    continue;
                }
                let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                    log::debug!("no cached target {target_id} to listen to");
                    continue;
                };
                let target_data = self.local_store.allocate_target(cached.target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    state,
                    Query::from_target(&cached.target),
                    target_data.target_id,
                    false,
                    &target_data.resume_token,
                    &mut effects,
                )?;
                target_data
            };
            self.flush(effects).await?;
            self.remote_store.listen(target_data).await?;
        }

        for target_id in removed {
            let mut effects = Effects::default();
            {
                let mut guard = self.state()?;
                let state = &mut *guard;
                if !state.queries_by_target.contains_key(&target_id) {
                    continue;
                }
                match self.local_store.release_target(target_id, false) {
                    Ok(()) => {
                        effects.remote.push(RemoteAction::Unlisten(target_id));
                        self.remove_and_cleanup_target(state, target_id, None, &mut effects)?;
                    }
                    Err(err) if is_primary_lease_lost(&err) => {
                        log::debug!("failed to release target {target_id}: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
            self.flush(effects).await?;
        }
        Ok(())
    }

    /// Pushes `online_state` into every view and the listener.
    fn apply_online_state(&self, online_state: OnlineState) {
        let snapshots = {
            let Ok(mut state) = self.state() else {
                return;
            };
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            state.online_state = online_state;
            snapshots
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
    }

    /// Fails the callbacks of the current user and stops the network.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.remote_store.shutdown().await?;
        self.shared_client_state.shutdown()?;
        let mut state = self.state()?;
        for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled("The client has been terminated")));
            }
        }
        Ok(())
    }

    fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
        error: Option<FirestoreError>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id)?;
        let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
        for query in queries {
            state.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                effects.errors.push((query, error.clone()));
            }
        }
        if state.is_primary == Some(true) {
            let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
            for key in limbo_keys {
                if !state.limbo_document_refs.contains_key(&key) {
                    self.remove_limbo_target(state, &key, effects);
                }
            }
        }
        Ok(())
    }

    fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        let is_primary = state.is_primary == Some(true);
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // Documents left a full limit; rerun the query so cached
                // documents beyond the old edge can move in.
                let query_result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, is_primary, target_change, pending_reset);

            if let Some(snapshot) = view_change.snapshot {
                if is_primary {
                    let status = if snapshot.from_cache {
                        QueryTargetStatus::NotCurrent
                    } else {
                        QueryTargetStatus::Current
                    };
                    self.shared_client_state.update_query_state(target_id, status, None)?;
                }
                let (added_keys, removed_keys) = snapshot.added_and_removed_keys();
                view_changes.push(LocalViewChanges {
                    target_id,
                    from_cache: snapshot.from_cache,
                    added_keys,
                    removed_keys,
                });
                effects.snapshots.push(snapshot);
            }
            self.update_tracked_limbos(state, target_id, view_change.limbo_changes, effects);
        }
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
        limbo_changes: Vec<LimboDocumentChange>,
        effects: &mut Effects,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key, effects);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key, effects);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&self, state: &mut SyncEngineState, key: DocumentKey, effects: &mut Effects) {
        if state.active_limbo_targets_by_key.contains_key(&key) || state.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("New document in limbo: {key}");
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state, effects);
    }

    /// Starts limbo targets for queued keys while slots are free.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState, effects: &mut Effects) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state.active_limbo_targets_by_key.insert(key.clone(), target_id);
            effects.remote.push(RemoteAction::Listen(TargetData::new(
                Query::document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey, effects: &mut Effects) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = state.active_limbo_targets_by_key.remove(key) {
            effects.remote.push(RemoteAction::Unlisten(target_id));
            state.active_limbo_resolutions_by_target.remove(&target_id);
            self.pump_enqueued_limbo_resolutions(state, effects);
        }
    }

    fn reset_limbo_documents(state: &mut SyncEngineState, effects: &mut Effects) {
        for target_id in state.active_limbo_resolutions_by_target.keys() {
            effects.remote.push(RemoteAction::Unlisten(*target_id));
        }
        state.limbo_document_refs.remove_all_references();
        state.active_limbo_resolutions_by_target.clear();
        state.active_limbo_targets_by_key.clear();
        state.enqueued_limbo_resolutions.clear();
    }

    fn process_user_callback(state: &mut SyncEngineState, batch_id: i32, error: Option<FirestoreError>) {
        let user_key = state.current_user.to_key();
        let Some(callback) = state
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id))
        else {
            return;
        };
        let _ = callback.send(match error {
            Some(error) => Err(error),
            None => Ok(()),
        });
    }

    fn trigger_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: i32) {
        for callback in state.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            for (target_id, change) in &event.target_changes {
                let Some(limbo) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let total = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if total > 1 {
                    return Err(internal_error(
                        "Limbo resolution for single document contains multiple changes.",
                    ));
                }
                if !change.added_documents.is_empty() {
                    limbo.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !limbo.received_document {
                        return Err(internal_error("Received change for limbo target document without add."));
                    }
                } else if !change.removed_documents.is_empty() {
                    if !limbo.received_document {
                        return Err(internal_error("Received remove for limbo target document without add."));
                    }
                    limbo.received_document = false;
                }
            }

            let changes = match self.local_store.apply_remote_event(&event) {
                Ok(changes) => changes,
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("dropping remote event after losing the primary lease: {err}");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event), &mut effects)?;
        }
        self.flush(effects).await
    }

    async fn reject_listen(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let synthesized = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(limbo) => {
                    state.active_limbo_targets_by_key.remove(&limbo.key);
                    self.pump_enqueued_limbo_resolutions(state, &mut effects);
                    // Access to the document was lost; resolve it as deleted.
                    let mut event = RemoteEvent {
                        snapshot_version: Timestamp::MIN,
                        ..RemoteEvent::default()
                    };
                    event.document_updates.insert(
                        limbo.key.clone(),
                        MutableDocument::new_no_document(limbo.key.clone(), Timestamp::MIN),
                    );
                    event.resolved_limbo_documents.insert(limbo.key);
                    Some(event)
                }
                None => {
                    self.shared_client_state.update_query_state(
                        target_id,
                        QueryTargetStatus::Rejected,
                        Some(error.clone()),
                    )?;
                    match self.local_store.release_target(target_id, false) {
                        Ok(()) => {}
                        Err(err) if is_primary_lease_lost(&err) => {
                            log::debug!("failed to release rejected target {target_id}: {err}");
                        }
                        Err(err) => return Err(err),
                    }
                    self.remove_and_cleanup_target(state, target_id, Some(error), &mut effects)?;
                    None
                }
            }
        };
        self.flush(effects).await?;
        if let Some(event) = synthesized {
            self.apply_remote_event(event).await?;
        }
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let changes = match self.local_store.acknowledge_batch(&result) {
                Ok(changes) => changes,
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("dropping acknowledgement of batch {batch_id}: {err}");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            Self::process_user_callback(state, batch_id, None);
            Self::trigger_pending_writes_callbacks(state, batch_id);
            self.shared_client_state.update_mutation_state(
                batch_id,
                MutationBatchStatus::Acknowledged,
                None,
                result.batch.keys(),
            )?;
            self.emit_new_snaps_and_notify_local_store(state, &changes, None, &mut effects)?;
        }
        self.flush(effects).await
    }

    async fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let changes = match self.local_store.reject_batch(batch_id) {
                Ok(changes) => changes,
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("dropping rejection of batch {batch_id}: {err}");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let keys: BTreeSet<DocumentKey> = changes.keys().cloned().collect();
            Self::process_user_callback(state, batch_id, Some(error.clone()));
            Self::trigger_pending_writes_callbacks(state, batch_id);
            self.shared_client_state
                .update_mutation_state(batch_id, MutationBatchStatus::Rejected, Some(error), keys)?;
            self.emit_new_snaps_and_notify_local_store(state, &changes, None, &mut effects)?;
        }
        self.flush(effects).await
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.state()?.current_user == user {
            return Ok(());
        }
        log::debug!("User change. New user: {}", user.to_key());
        let mut effects = Effects::default();
        {
            let mut guard = self.state()?;
            let state = &mut *guard;
            for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
                for callback in callbacks {
                    let _ = callback.send(Err(cancelled(
                        "Waiting for pending writes was cancelled because the user changed.",
                    )));
                }
            }
            let result = self.local_store.handle_user_change(user.clone())?;
            state.current_user = user.clone();
            self.shared_client_state
                .handle_user_change(user, &result.added_batch_ids)?;
            self.emit_new_snaps_and_notify_local_store(state, &result.affected_documents, None, &mut effects)?;
        }
        self.flush(effects).await
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        // Secondaries take the online state from the primary.
        if !self.is_primary() {
            return;
        }
        self.apply_online_state(online_state);
        if let Err(err) = self.shared_client_state.set_online_state(online_state) {
            log::debug!("failed to share online state: {err}");
        }
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        let Ok(state) = self.state() else {
            return BTreeSet::new();
        };
        if let Some(limbo) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if limbo.received_document {
                return BTreeSet::from([limbo.key.clone()]);
            }
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}
