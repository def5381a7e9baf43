//! Transactional entry point to the local cache.
//!
//! Every public operation runs as one persistence transaction. The store keeps
//! an in-memory map of active targets so that resume tokens and limbo-free
//! snapshot versions can advance without a write on every remote event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::error::{internal_error, is_primary_lease_lost, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::{IndexAutoCreationSettings, QueryEngine};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::firestore::local::schema::tables;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldMask, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    Precondition, Timestamp, TransformOperation, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

/// Resume tokens older than this are written even when nothing else changed.
const RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Outcome of a local write: the new batch id and the documents it changed.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: DocumentMap,
}

/// Documents matching a query together with the keys the backend last
/// reported for its target.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Batches and documents affected by switching to another user.
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
}

/// Keys that entered or left a view, reported back to pin them against
/// garbage collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStoreSettings {
    pub index_auto_creation: IndexAutoCreationSettings,
}

struct LocalStoreState {
    user: User,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    documents_view: LocalDocumentsView,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<i32, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, i32>,
    local_view_references: ReferenceSet,
}

pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    index_manager: IndexManager,
    settings: LocalStoreSettings,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, user: User, settings: LocalStoreSettings) -> Self {
        let remote_documents = RemoteDocumentCache::new();
        let index_manager = IndexManager::new();
        let state = Self::state_for_user(user, remote_documents, index_manager, settings);
        Self {
            persistence,
            remote_documents,
            target_cache: TargetCache::new(),
            index_manager,
            settings,
            state: Mutex::new(state),
        }
    }

    fn state_for_user(
        user: User,
        remote_documents: RemoteDocumentCache,
        index_manager: IndexManager,
        settings: LocalStoreSettings,
    ) -> LocalStoreState {
        let mutation_queue = MutationQueue::new(&user);
        let overlays = DocumentOverlayCache::new(&user);
        let documents_view =
            LocalDocumentsView::new(remote_documents, mutation_queue.clone(), overlays.clone(), index_manager);
        let query_engine = QueryEngine::new(documents_view.clone(), index_manager, settings.index_auto_creation);
        LocalStoreState {
            user,
            mutation_queue,
            overlays,
            documents_view,
            query_engine,
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    fn state(&self) -> FirestoreResult<MutexGuard<'_, LocalStoreState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("local store state lock poisoned"))
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> FirestoreResult<User> {
        Ok(self.state()?.user.clone())
    }

    /// Verifies the queue of the initial user. Called once at startup.
    pub fn start(&self) -> FirestoreResult<()> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Start local store", TransactionMode::ReadOnly, |txn| {
                state.mutation_queue.perform_consistency_check(txn)
            })
    }

    /// Switches to `user`'s mutation queue and returns every document whose
    /// local view may differ between the two users.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut state = self.state()?;
        let next = Self::state_for_user(user, self.remote_documents, self.index_manager, self.settings);
        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = state.mutation_queue.all_mutation_batches(txn);
                let new_batches = next.mutation_queue.all_mutation_batches(txn);
                let changed_keys: BTreeSet<DocumentKey> = old_batches
                    .iter()
                    .chain(new_batches.iter())
                    .flat_map(MutationBatch::keys)
                    .collect();
                let documents = next.documents_view.get_documents(txn, &changed_keys)?;
                Ok(UserChangeResult {
                    affected_documents: documents,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })?;
        let LocalStoreState {
            target_data_by_target,
            target_id_by_canonical_id,
            local_view_references,
            ..
        } = std::mem::replace(&mut *state, next);
        state.target_data_by_target = target_data_by_target;
        state.target_id_by_canonical_id = target_id_by_canonical_id;
        state.local_view_references = local_view_references;
        Ok(result)
    }

    /// Appends a batch with `mutations`, folds it into the overlays, and
    /// returns the resulting local view of every affected document.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key.clone()).collect();
        let state = self.state()?;
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let mut overlayed = state.documents_view.get_overlayed_documents(txn, &keys)?;

                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let document = overlayed.get(&mutation.key)?;
                        let base_value = mutation.extract_base_value(&document.document)?;
                        let mask = FieldMask::new(
                            mutation
                                .field_transforms
                                .iter()
                                .filter(|transform| matches!(transform.operation, TransformOperation::NumericIncrement(_)))
                                .map(|transform| transform.field.clone()),
                        );
                        Some(
                            Mutation::patch(mutation.key.clone(), base_value, mask)
                                .with_precondition(Precondition::Exists(true)),
                        )
                    })
                    .collect();

                let batch = state
                    .mutation_queue
                    .add_mutation_batch(txn, local_write_time, base_mutations, mutations.clone())?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed);
                state.overlays.save_overlays(txn, batch.batch_id, &overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
    }

    /// Folds an acknowledged batch into the remote documents and drops it
    /// from the queue.
    pub fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let affected = batch.keys();
                let mut buffer = self.remote_documents.new_change_buffer();
                for key in &affected {
                    let mut document = buffer.get_entry(txn, key);
                    let Some(ack_version) = batch_result.doc_versions.get(key).copied() else {
                        return Err(internal_error(format!("no ack version for {key}")));
                    };
                    // Several batches committed together share one version.
                    let committed_together =
                        document.version() == ack_version && document.has_committed_mutations();
                    if document.version() < ack_version || committed_together {
                        batch.apply_to_remote_document(&mut document, batch_result);
                        if document.is_valid_document() {
                            document.set_read_time(batch_result.commit_version);
                            buffer.add_entry(document);
                        }
                    }
                }
                state.mutation_queue.remove_mutation_batch(txn, batch)?;
                state
                    .mutation_queue
                    .acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
                buffer.apply(txn)?;
                state.mutation_queue.perform_consistency_check(txn)?;
                state
                    .overlays
                    .remove_overlays_for_batch_id(txn, &affected, batch.batch_id)?;

                let with_transform_results: BTreeSet<DocumentKey> = batch
                    .mutations
                    .iter()
                    .zip(&batch_result.mutation_results)
                    .filter(|(_, result)| !result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key.clone())
                    .collect();
                state
                    .documents_view
                    .recalculate_and_save_overlays_for_document_keys(txn, &with_transform_results)?;
                state.documents_view.get_documents(txn, &affected)
            })
    }

    /// Drops a batch the backend refused and returns the restored local view.
    pub fn reject_batch(&self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = state
                    .mutation_queue
                    .lookup_mutation_batch(txn, batch_id)
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                state.mutation_queue.remove_mutation_batch(txn, &batch)?;
                state.mutation_queue.perform_consistency_check(txn)?;
                state.overlays.remove_overlays_for_batch_id(txn, &affected, batch_id)?;
                state
                    .documents_view
                    .recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                state.documents_view.get_documents(txn, &affected)
            })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                Ok(state.mutation_queue.highest_unacknowledged_batch_id(txn))
            })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<Timestamp> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                Ok(self.target_cache.get_last_remote_snapshot_version(txn))
            })
    }

    /// Applies a consistent remote snapshot: target metadata, remote
    /// documents, and the global snapshot version. Returns the local view of
    /// every changed document.
    pub fn apply_remote_event(&self, remote_event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut state = self.state()?;
        let remote_version = remote_event.snapshot_version;
        let mut new_target_data = state.target_data_by_target.clone();

        let changed = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                for (target_id, change) in &remote_event.target_changes {
                    let Some(old) = new_target_data.get(target_id).cloned() else {
                        continue;
                    };
                    self.target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    self.target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut updated = old.with_sequence_number(txn.current_sequence_number()?);
                    if remote_event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), Timestamp::MIN)
                            .with_last_limbo_free_snapshot_version(Timestamp::MIN);
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(&old, &updated, change) {
                        self.target_cache.update_target_data(txn, &updated)?;
                    }
                    new_target_data.insert(*target_id, updated);
                }

                let sequence_number = txn.current_sequence_number()?;
                for key in remote_event.document_updates.keys() {
                    if remote_event.resolved_limbo_documents.contains(key) {
                        txn.put(tables::document_sequence_numbers, key.clone(), sequence_number)?;
                    }
                }

                let mut buffer = self.remote_documents.new_change_buffer();
                let (changed_documents, existence_changed) =
                    populate_document_change_buffer(txn, &mut buffer, &remote_event.document_updates);

                if !remote_version.is_min() {
                    let last = self.target_cache.get_last_remote_snapshot_version(txn);
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot {remote_version:?} < {last:?}"
                        )));
                    }
                    self.target_cache
                        .set_target_globals(txn, sequence_number, Some(remote_version))?;
                }
                buffer.apply(txn)?;

                let views = state
                    .documents_view
                    .get_local_view_of_documents(txn, changed_documents, &existence_changed)?;
                Ok(views
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.document))
                    .collect())
            })?;
        state.target_data_by_target = new_target_data;
        Ok(changed)
    }

    /// Records which keys entered and left each view so they stay pinned,
    /// and advances the limbo-free snapshot version of views that are
    /// synced with the backend.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.state()?;
        let result = self
            .persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.current_sequence_number()?;
                for change in view_changes {
                    for key in change.added_keys.iter().chain(change.removed_keys.iter()) {
                        txn.put(tables::document_sequence_numbers, key.clone(), sequence_number)?;
                    }
                }
                Ok(())
            });
        if let Err(err) = result {
            if !is_primary_lease_lost(&err) {
                return Err(err);
            }
            log::debug!("failed to update sequence numbers: {err}");
        }

        let mut limbo_free_updates = Vec::new();
        for change in view_changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            if change.from_cache {
                continue;
            }
            let Some(target_data) = state.target_data_by_target.get(&change.target_id) else {
                return Err(internal_error(format!(
                    "Can't set limbo-free snapshot version for unknown target {}",
                    change.target_id
                )));
            };
            let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            state.target_data_by_target.insert(change.target_id, updated.clone());
            limbo_free_updates.push(updated);
        }
        if !limbo_free_updates.is_empty() {
            self.persistence
                .run_transaction("Persist limbo-free snapshot versions", TransactionMode::ReadWrite, |txn| {
                    for target_data in &limbo_free_updates {
                        if txn.tables().targets.contains_key(&target_data.target_id) {
                            self.target_cache.update_target_data(txn, target_data)?;
                        }
                    }
                    Ok(())
                })?;
        }
        Ok(())
    }

    /// First batch after `after_batch_id`, or the oldest when `None`.
    pub fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                Ok(state
                    .mutation_queue
                    .next_mutation_batch_after_batch_id(txn, after_batch_id.unwrap_or(BATCH_ID_UNKNOWN)))
            })
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Lookup mutation batch", TransactionMode::ReadOnly, |txn| {
                Ok(state.mutation_queue.lookup_mutation_batch(txn, batch_id))
            })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                Ok(state.documents_view.get_document(txn, key))
            })
    }

    /// Returns the target data for `target`, allocating a new target id the
    /// first time it is seen.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.state()?;
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.current_sequence_number()?;
                if let Some(cached) = self.target_cache.get_target_data(txn, &target) {
                    let refreshed = cached.with_sequence_number(sequence_number);
                    self.target_cache.update_target_data(txn, &refreshed)?;
                    return Ok(refreshed);
                }
                let target_id = self.target_cache.allocate_target_id(txn)?;
                let target_data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
                self.target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })?;

        let target_id = target_data.target_id;
        let newer = state
            .target_data_by_target
            .get(&target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if newer {
            state.target_data_by_target.insert(target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_id);
        }
        Ok(state
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or(target_data))
    }

    /// Target data of an active or cached target equal to `target`.
    pub fn get_local_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.state()?;
        if let Some(target_data) = Self::active_target_data(&state, target) {
            return Ok(Some(target_data));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                Ok(self.target_cache.get_target_data(txn, target))
            })
    }

    fn active_target_data(state: &LocalStoreState, target: &Target) -> Option<TargetData> {
        state
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .cloned()
    }

    /// Cached target data by id, for contexts that did not allocate it.
    pub fn get_cached_target(&self, target_id: i32) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.state()?.target_data_by_target.get(&target_id) {
            return Ok(Some(target_data.clone()));
        }
        self.persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                Ok(self.target_cache.get_target_data_by_id(txn, target_id))
            })
    }

    /// Stops tracking `target_id` in memory. Unless `keep_persisted_target_data`
    /// is set the target's sequence number is refreshed so the collector sees
    /// when it was last used; physical removal is left to garbage collection.
    pub fn release_target(&self, target_id: i32, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let mut state = self.state()?;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(internal_error(format!("Tried to release nonexistent target: {target_id}")));
        };
        if !keep_persisted_target_data {
            let result = self
                .persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    let updated = target_data.with_sequence_number(txn.current_sequence_number()?);
                    self.target_cache.update_target_data(txn, &updated)
                });
            match result {
                Ok(()) => {}
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("failed to update sequence numbers for target {target_id}: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        state.local_view_references.remove_references_for_id(target_id);
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// keys of the last limbo-free snapshot seed the result.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let state = self.state()?;
        let target = query.to_target();
        let active = Self::active_target_data(&state, &target);
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target_data = match active.clone() {
                    Some(target_data) => Some(target_data),
                    None => self.target_cache.get_target_data(txn, &target),
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        self.target_cache
                            .get_matching_keys_for_target_id(txn, target_data.target_id),
                    ),
                    None => (Timestamp::MIN, BTreeSet::new()),
                };
                let (version, keys) = if use_previous_results {
                    (last_limbo_free, remote_keys.clone())
                } else {
                    (Timestamp::MIN, BTreeSet::new())
                };
                let documents = state
                    .query_engine
                    .get_documents_matching_query(txn, query, version, &keys)?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    pub fn get_remote_document_keys(&self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                Ok(self.target_cache.get_matching_keys_for_target_id(txn, target_id))
            })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                Ok(state.mutation_queue.last_stream_token(txn))
            })
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                state.mutation_queue.set_last_stream_token(txn, stream_token)
            })
    }

    /// Local view of the documents touched by `batch_id`.
    pub fn lookup_mutation_documents(&self, batch_id: i32) -> FirestoreResult<Option<DocumentMap>> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadWrite, |txn| {
                match state.mutation_queue.lookup_mutation_batch(txn, batch_id) {
                    Some(batch) => Ok(Some(state.documents_view.get_documents(txn, &batch.keys())?)),
                    None => Ok(None),
                }
            })
    }

    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = self.index_manager.get_field_indexes(txn, None);
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.same_definition(index)) {
                        self.index_manager.delete_field_index(txn, index.index_id)?;
                    }
                }
                for index in indexes.iter().cloned() {
                    if !existing.iter().any(|present| present.same_definition(&index)) {
                        self.index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.state()?.query_engine.set_index_auto_creation_enabled(enabled);
        Ok(())
    }

    pub fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let state = self.state()?;
        let active: BTreeSet<i32> = state.target_data_by_target.keys().copied().collect();
        collector.collect(self.persistence.as_ref(), &active, &state.local_view_references)
    }

    pub fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        let state = self.state()?;
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                backfiller.write_index_entries(txn, &state.documents_view, &self.index_manager)
            })
    }

    pub fn shutdown(&self) -> FirestoreResult<()> {
        self.persistence.shutdown()
    }
}

/// Stages accepted document updates. Returns the staged documents and the
/// keys whose existence flipped.
fn populate_document_change_buffer(
    txn: &PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    documents: &BTreeMap<DocumentKey, MutableDocument>,
) -> (DocumentMap, BTreeSet<DocumentKey>) {
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();
    let existing = buffer.get_entries(txn, documents.keys());
    for (key, document) in documents {
        let Some(current) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != current.is_found_document() {
            existence_changed.insert(key.clone());
        }
        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes carry no version; access was lost, so the
            // entry is dropped rather than stored.
            buffer.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !current.is_valid_document()
            || document.version() > current.version()
            || (document.version() == current.version() && current.has_pending_writes())
        {
            buffer.add_entry(document.clone());
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {:?}, watch version {:?}",
                current.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

/// Whether an updated target must be written now rather than left in memory.
fn should_persist_target_data(old: &TargetData, updated: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = updated.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE.as_micros() as i64 {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::lease::OwnerRecord;
    use crate::firestore::model::{FieldPath, MutationResult, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn store() -> LocalStore {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new("local"));
        persistence
            .run_transaction("claim", TransactionMode::ReadWrite, |txn| {
                txn.replace(
                    tables::owner,
                    Some(OwnerRecord {
                        owner_id: "local".into(),
                        lease_timestamp_ms: 0,
                        allow_tab_synchronization: true,
                    }),
                )
            })
            .unwrap();
        LocalStore::new(persistence, User::unauthenticated(), LocalStoreSettings::default())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(field: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        data
    }

    fn found(path: &str, version: i64, data: MapValue) -> MutableDocument {
        MutableDocument::new_found_document(key(path), Timestamp::new(version, 0), data)
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
    }

    fn event_with(target_id: i32, version: i64, documents: Vec<MutableDocument>) -> RemoteEvent {
        let mut change = TargetChange::default();
        change.resume_token = vec![version as u8];
        change.current = true;
        let mut updates = BTreeMap::new();
        for mut document in documents {
            document.set_read_time(Timestamp::new(version, 0));
            change.added_documents.insert(document.key().clone());
            updates.insert(document.key().clone(), document);
        }
        RemoteEvent {
            snapshot_version: Timestamp::new(version, 0),
            target_changes: BTreeMap::from([(target_id, change)]),
            target_mismatches: BTreeMap::new(),
            document_updates: updates,
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    #[test]
    fn acknowledged_write_converges_with_remote_state() {
        let store = store();
        let write = store.local_write(vec![Mutation::set(key("rooms/a"), map("n", 1))]).unwrap();
        let local = &write.changes[&key("rooms/a")];
        assert!(local.has_local_mutations());
        assert_eq!(local.version(), Timestamp::MIN);

        let batch = store.next_mutation_batch(None).unwrap().unwrap();
        let result = MutationBatchResult::from(
            batch,
            Timestamp::new(5, 0),
            vec![MutationResult {
                version: Timestamp::new(5, 0),
                transform_results: vec![],
            }],
            vec![1],
        )
        .unwrap();
        let changes = store.acknowledge_batch(&result).unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(!document.has_local_mutations());
        assert!(document.has_committed_mutations());
        assert_eq!(document.version(), Timestamp::new(5, 0));
        assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);

        let target_data = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_with(target_data.target_id, 5, vec![found("rooms/a", 5, map("n", 1))]))
            .unwrap();
        let document = store.read_document(&key("rooms/a")).unwrap();
        assert!(!document.has_pending_writes());
        assert_eq!(document.data(), &map("n", 1));
    }

    #[test]
    fn batches_committed_at_same_version_all_apply() {
        let store = store();
        store.local_write(vec![Mutation::set(key("rooms/a"), map("x", 1))]).unwrap();
        let patch = Mutation::patch(
            key("rooms/a"),
            map("y", 2),
            FieldMask::new([FieldPath::from_dot_separated("y").unwrap()]),
        );
        store.local_write(vec![patch]).unwrap();

        for _ in 0..2 {
            let batch = store.next_mutation_batch(None).unwrap().unwrap();
            let result = MutationBatchResult::from(
                batch,
                Timestamp::new(7, 0),
                vec![MutationResult {
                    version: Timestamp::new(7, 0),
                    transform_results: vec![],
                }],
                vec![1],
            )
            .unwrap();
            store.acknowledge_batch(&result).unwrap();
        }

        let document = store.read_document(&key("rooms/a")).unwrap();
        let mut expected = map("x", 1);
        expected.set(&FieldPath::from_dot_separated("y").unwrap(), FirestoreValue::from_integer(2));
        assert_eq!(document.data(), &expected);
        assert_eq!(document.version(), Timestamp::new(7, 0));
        assert!(!document.has_local_mutations());
        assert!(document.has_committed_mutations());
    }

    #[test]
    fn pending_patch_over_missing_document_keeps_version_min() {
        let store = store();
        let patch = Mutation::patch(
            key("rooms/a"),
            map("n", 2),
            FieldMask::new([FieldPath::from_dot_separated("n").unwrap()]),
        )
        .with_precondition(Precondition::None);
        store.local_write(vec![patch]).unwrap();
        let document = store.read_document(&key("rooms/a")).unwrap();
        assert!(document.has_local_mutations());
        assert!(document.version().is_min());
    }

    #[test]
    fn stale_remote_updates_are_ignored() {
        let store = store();
        let target_data = store.allocate_target(rooms().to_target()).unwrap();
        let target_id = target_data.target_id;
        store
            .apply_remote_event(&event_with(target_id, 10, vec![found("rooms/a", 10, map("n", 10))]))
            .unwrap();
        let changes = store
            .apply_remote_event(&event_with(target_id, 11, vec![found("rooms/a", 9, map("n", 9))]))
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.read_document(&key("rooms/a")).unwrap().data(), &map("n", 10));
        assert_eq!(store.get_last_remote_snapshot_version().unwrap(), Timestamp::new(11, 0));
    }

    #[test]
    fn rejected_batch_restores_remote_view() {
        let store = store();
        let write = store.local_write(vec![Mutation::set(key("rooms/a"), map("n", 1))]).unwrap();
        let changes = store.reject_batch(write.batch_id).unwrap();
        assert!(!changes[&key("rooms/a")].is_valid_document());
        assert!(store.next_mutation_batch(None).unwrap().is_none());
    }

    #[test]
    fn released_target_is_reused_on_next_allocation() {
        let store = store();
        let first = store.allocate_target(rooms().to_target()).unwrap();
        store.release_target(first.target_id, false).unwrap();
        let second = store.allocate_target(rooms().to_target()).unwrap();
        assert_eq!(first.target_id, second.target_id);
        assert!(second.sequence_number > first.sequence_number);
    }

    #[test]
    fn execute_query_uses_cache_and_overlays() {
        let store = store();
        let target_data = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_with(target_data.target_id, 3, vec![found("rooms/a", 3, map("n", 1))]))
            .unwrap();
        store.local_write(vec![Mutation::set(key("rooms/b"), map("n", 2))]).unwrap();
        let result = store.execute_query(&rooms(), true).unwrap();
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.remote_keys, BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn user_change_swaps_mutation_queues() {
        let store = store();
        store.local_write(vec![Mutation::set(key("rooms/a"), map("n", 1))]).unwrap();
        let result = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/a")].is_valid_document());
        assert!(store.next_mutation_batch(None).unwrap().is_none());
    }
}
