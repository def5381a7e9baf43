use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, MutationResult, Timestamp, User};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{WatchStream, WatchStreamListener, WriteStream, WriteStreamListener};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffConfig;

/// Batches sent to the backend but not yet acknowledged.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the network is currently unused. The streams only run while the
/// set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    IsSecondary,
    CredentialChange,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets to (re)send whenever the watch stream opens.
    listen_targets: BTreeMap<i32, TargetData>,
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

struct ListenTargets<'a> {
    targets: &'a BTreeMap<i32, TargetData>,
    syncer: Option<Arc<dyn RemoteSyncer>>,
}

impl TargetMetadataProvider for ListenTargets<'_> {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer
            .as_ref()
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }
}

/// Owns the listen and write streams and translates their events into
/// [`RemoteSyncer`] calls.
///
/// Every method must run on the async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    local_store: Arc<LocalStore>,
    syncer: Weak<dyn RemoteSyncer>,
    serializer: JsonProtoSerializer,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        network: NetworkLayer,
        serializer: JsonProtoSerializer,
        queue: AsyncQueue,
        syncer: Weak<dyn RemoteSyncer>,
        backoff: BackoffConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = WatchStream::new(
                queue.clone(),
                network.clone(),
                serializer.clone(),
                Arc::new(WatchListener { inner: weak.clone() }),
                backoff,
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                network,
                serializer.clone(),
                Arc::new(WriteListener { inner: weak.clone() }),
                backoff,
            );
            let handler_syncer = syncer.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue,
                Arc::new(move |online_state| {
                    if let Some(syncer) = handler_syncer.upgrade() {
                        syncer.apply_online_state_change(online_state);
                    }
                }),
            );
            RemoteStoreInner {
                local_store,
                syncer,
                serializer,
                watch_stream,
                write_stream,
                online_state_tracker,
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Starts the streams if there is anything to do.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and forces the online state to `Offline`.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await?;
        self.inner.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await?;
        self.inner.online_state_tracker.set(OnlineState::Unknown);
        Ok(())
    }

    /// Starts watching `target_data`. Already watched targets are ignored.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut state = self.inner.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
        }
        if self.inner.should_start_watch_stream().await {
            self.inner.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        let (removed, no_targets_left, can_use_network) = {
            let mut state = self.inner.state.lock().await;
            let removed = state.listen_targets.remove(&target_id).is_some();
            (removed, state.listen_targets.is_empty(), state.offline_causes.is_empty())
        };
        if !removed {
            return Ok(());
        }
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id).await?;
        }
        if no_targets_left {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if can_use_network {
                // Nothing to send, so the stream cannot prove itself healthy.
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Moves pending batches from the local store into the write pipeline and
    /// sends them once the handshake is done.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams so they reconnect with the new user's token.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("remote store received new credentials");
        let used_network = {
            let mut state = self.inner.state.lock().await;
            let used_network = state.offline_causes.is_empty();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            used_network
        };
        self.inner.disable_network_internal().await?;
        if used_network {
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
        if let Some(syncer) = self.inner.syncer.upgrade() {
            syncer.handle_credential_change(user).await?;
        }
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await
    }

    /// Only the primary context talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await
        } else {
            self.inner.state.lock().await.offline_causes.insert(OfflineCause::IsSecondary);
            self.inner.disable_network_internal().await?;
            self.inner.online_state_tracker.set(OnlineState::Unknown);
            Ok(())
        }
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.can_use_network().await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }

    pub async fn is_listening(&self, target_id: i32) -> bool {
        self.inner.state.lock().await.listen_targets.contains_key(&target_id)
    }
}

impl RemoteStoreInner {
    async fn can_use_network(&self) -> bool {
        self.state.lock().await.offline_causes.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) -> FirestoreResult<()> {
        self.write_stream.stop().await?;
        self.watch_stream.stop().await?;
        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!("stopping write stream with {} pending writes", state.write_pipeline.len());
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
        Ok(())
    }

    async fn should_start_watch_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !self.watch_stream.is_started() && !state.listen_targets.is_empty()
    }

    async fn start_watch_stream(&self) {
        self.state.lock().await.watch_aggregator = Some(WatchChangeAggregator::new(self.serializer.clone()));
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let request = match self.syncer.upgrade() {
            Some(syncer) if resuming => {
                let expected_count = syncer.get_remote_keys_for_target(target_id).len() as i32;
                target_data.with_expected_count(expected_count)
            }
            _ => target_data,
        };
        self.watch_stream.watch(&request).await
    }

    async fn send_unwatch_request(&self, target_id: i32) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self.state.lock().await.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.state.lock().await.watch_aggregator = None;
        if self.should_start_watch_stream().await {
            self.online_state_tracker.handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()> {
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    return self.handle_target_error(target_change, cause.clone()).await;
                }
            }
        }

        {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargets {
                targets: listen_targets,
                syncer: self.syncer.upgrade(),
            };
            match change {
                WatchChange::Document(document_change) => aggregator.handle_document_change(&provider, document_change),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&provider, &filter),
                WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&provider, &target_change),
            }
        }

        if !snapshot_version.is_min() {
            let last_remote_snapshot_version = self.local_store.get_last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Turns the aggregated changes into a remote event, updates resume
    /// tokens, re-listens mismatched targets, and hands the event to the
    /// syncer.
    async fn raise_watch_snapshot(&self, snapshot_version: Timestamp) -> FirestoreResult<()> {
        let (event, relistens) = {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargets {
                targets: listen_targets,
                syncer: self.syncer.upgrade(),
            };
            let event = aggregator.create_remote_event(&provider, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.get_mut(target_id) {
                    *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut relistens = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // The stored token is useless once the target is known to be
                // out of sync.
                *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                relistens.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, relistens)
        };

        for request in relistens {
            log::debug!("re-listening target {} after existence filter mismatch", request.target_id);
            self.send_unwatch_request(request.target_id).await?;
            self.send_watch_request(request).await?;
        }

        match self.syncer.upgrade() {
            Some(syncer) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    async fn handle_target_error(&self, change: &WatchTargetChange, cause: FirestoreError) -> FirestoreResult<()> {
        for target_id in &change.target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if !removed {
                continue;
            }
            log::debug!("target {target_id} rejected: {cause}");
            if let Some(syncer) = self.syncer.upgrade() {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .state
            .lock()
            .await
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline().await {
            match self.local_store.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch).await?;
                }
                None => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    async fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.state.lock().await.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake().await
    }

    /// Records the token and replays the whole pipeline in order.
    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())?;
        let pending: Vec<_> = self
            .state
            .lock()
            .await
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in pending {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(&self, commit_version: Timestamp, results: Vec<MutationResult>) -> FirestoreResult<()> {
        let batch = self
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Got a write result with an empty write pipeline"))?;
        let result = MutationBatchResult::from(batch, commit_version, results, self.write_stream.last_stream_token())?;
        if let Some(syncer) = self.syncer.upgrade() {
            syncer.apply_successful_write(result).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let has_pending = !self.state.lock().await.write_pipeline.is_empty();
        if let (Some(error), true) = (error, has_pending) {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(error).await?;
            } else {
                self.handle_handshake_error(error)?;
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
        Ok(())
    }

    fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            log::debug!("write stream handshake failed permanently, resetting stream token: {error}");
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    /// Only permanent errors reject the head batch; anything else is retried
    /// when the stream reconnects.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        // The request itself was bad; the backend is not overloaded.
        self.write_stream.inhibit_backoff();
        log::debug!("batch {} rejected: {error}", batch.batch_id);
        if let Some(syncer) = self.syncer.upgrade() {
            syncer.reject_failed_write(batch.batch_id, error).await?;
        }
        self.fill_write_pipeline().await
    }
}

struct WatchListener {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WatchStreamListener for WatchListener {
    async fn on_watch_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_watch_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

struct WriteListener {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamListener for WriteListener {
    async fn on_write_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_mutation_result(&self, commit_version: Timestamp, results: Vec<MutationResult>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_mutation_result(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}
