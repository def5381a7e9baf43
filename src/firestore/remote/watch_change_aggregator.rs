use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, Timestamp};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// Read access to the targets the client is listening to.
pub trait TargetMetadataProvider {
    /// Keys the backend last reported for the target, as persisted locally.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// `None` once the target has been unlistened.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Accumulated state of one target between two snapshots.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests. Changes for a pending target are
    /// ignored since they refer to a previous incarnation.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // New targets always produce a change so the first snapshot is raised.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        debug_assert!(self.pending_responses >= 0, "more target responses than requests");
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch changes into [`RemoteEvent`]s.
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(provider, *target_id, document.clone());
                }
                _ => self.remove_document_from_target(provider, *target_id, &change.key, change.document.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &change.key, change.document.clone());
        }
    }

    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.target_ids_for_change(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // The target is live again; drop anything accumulated
                        // for its previous incarnation.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn target_ids_for_change(&self, change: &WatchTargetChange) -> Vec<i32> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    /// Compares the backend's count with ours. A mismatch the bloom filter
    /// cannot explain resets the target and records it for a re-listen.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, filter: &ExistenceFilterChange) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if let Some(key) = target_data.target.document_key() {
            if expected_count == 0 {
                // The single document is gone; resolve it as deleted so limbo
                // resolution can finish.
                let deleted = MutableDocument::new_no_document(key.clone(), Timestamp::MIN);
                self.remove_document_from_target(provider, target_id, &key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!("Single document existence filter with count {expected_count} for target {target_id}");
            }
            return;
        }

        let current_count = self.get_current_document_count_for_target(provider, target_id);
        if current_count == expected_count {
            return;
        }
        let application = self.apply_bloom_filter(provider, filter, current_count);
        if application != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "Existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: &ExistenceFilterChange,
        current_count: i32,
    ) -> BloomFilterApplication {
        let Some(names) = &filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter = match names.to_bloom_filter() {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                log::warn!("Applying bloom filter failed: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }
        let removed = self.filter_removed_documents(provider, &bloom_filter, filter.target_id);
        if filter.count != current_count - removed {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes every known key the bloom filter does not contain. Returns how
    /// many were removed.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: i32,
    ) -> i32 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = self.serializer.document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and clears the
    /// pending document state.
    pub fn create_remote_event(&mut self, provider: &dyn TargetMetadataProvider, snapshot_version: Timestamp) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self.target_states.get(&target_id).is_some_and(|state| state.current);
            if current {
                if let Some(key) = target_data.target.document_key() {
                    // A current document target without the document means it
                    // does not exist.
                    if !self.pending_document_updates.contains_key(&key)
                        && !target_contains_document(provider, target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(provider, *target_id) {
                    Some(target_data) => target_data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: i32, document: MutableDocument) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id).add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: i32,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left again before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    /// Keys we believe match, adjusted by the changes seen since the last
    /// snapshot.
    fn get_current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: i32) -> i32 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i32 + change.added_documents.len() as i32
            - change.removed_documents.len() as i32
    }

    /// Called for every watch or unwatch request sent for the target.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: i32) {
        debug_assert!(
            !self.target_states.get(&target_id).is_some_and(TargetState::is_pending),
            "should only reset active targets"
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: i32) -> bool {
        let active = self.target_data_for_active_target(provider, target_id).is_some();
        if !active {
            log::debug!("Detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: i32) -> Option<TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            None
        } else {
            provider.get_target_data_for_target(target_id)
        }
    }
}

fn target_contains_document(provider: &dyn TargetMetadataProvider, target_id: i32, key: &DocumentKey) -> bool {
    provider.get_remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::watch_change::UnchangedNames;
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct Targets {
        data: BTreeMap<i32, TargetData>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    }

    impl TargetMetadataProvider for Targets {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.data.get(&target_id).cloned()
        }
    }

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn rooms_target(target_id: i32) -> TargetData {
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap();
        TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
    }

    fn limbo_target(target_id: i32, path: &str) -> TargetData {
        TargetData::new(Query::document(&key(path)).to_target(), target_id, TargetPurpose::LimboResolution, 1)
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), Timestamp::new(version, 0), MapValue::empty())
    }

    fn added(target_id: i32, document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        }
    }

    #[test]
    fn pending_targets_ignore_changes_until_acknowledged() {
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(&targets, added(2, doc("rooms/a", 1)));
        let event = aggregator.create_remote_event(&targets, Timestamp::new(1, 0));
        assert!(event.target_changes.is_empty());

        aggregator.handle_target_change(&targets, &WatchTargetChange::new(TargetChangeState::Add, vec![2]));
        aggregator.handle_document_change(&targets, added(2, doc("rooms/b", 2)));
        aggregator.handle_target_change(
            &targets,
            &WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(vec![7]),
        );
        let event = aggregator.create_remote_event(&targets, Timestamp::new(2, 0));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![7]);
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), Timestamp::new(2, 0));
    }

    #[test]
    fn document_that_enters_and_leaves_produces_no_change() {
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_document_change(&targets, added(2, doc("rooms/a", 1)));
        aggregator.handle_document_change(
            &targets,
            DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key("rooms/a"),
                document: None,
            },
        );
        let event = aggregator.create_remote_event(&targets, Timestamp::new(1, 0));
        let change = &event.target_changes[&2];
        assert!(!change.has_document_changes());
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_resets_target() {
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        targets
            .remote_keys
            .insert(2, BTreeSet::from([key("rooms/a"), key("rooms/b")]));
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_existence_filter(
            &targets,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            },
        );
        let event = aggregator.create_remote_event(&targets, Timestamp::new(3, 0));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        let change = &event.target_changes[&2];
        assert!(!change.current);
        assert_eq!(change.removed_documents, BTreeSet::from([key("rooms/a"), key("rooms/b")]));
    }

    #[test]
    fn bloom_filter_removes_missing_keys_without_reset() {
        let serializer = serializer();
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        targets
            .remote_keys
            .insert(2, BTreeSet::from([key("rooms/a"), key("rooms/b")]));

        let mut bloom = BloomFilter::with_bit_count(1021, 7);
        bloom.insert(&serializer.document_name(&key("rooms/a")));

        let mut aggregator = WatchChangeAggregator::new(serializer);
        aggregator.handle_existence_filter(
            &targets,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(UnchangedNames::from_filter(&bloom)),
            },
        );
        let event = aggregator.create_remote_event(&targets, Timestamp::new(3, 0));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(event.target_changes[&2].removed_documents, BTreeSet::from([key("rooms/b")]));
    }

    #[test]
    fn invalid_bloom_filter_falls_back_to_reset() {
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        targets.remote_keys.insert(2, BTreeSet::from([key("rooms/a")]));
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_existence_filter(
            &targets,
            &ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: Some(UnchangedNames {
                    bitmap: vec![1],
                    padding: 9,
                    hash_count: 1,
                }),
            },
        );
        let event = aggregator.create_remote_event(&targets, Timestamp::new(3, 0));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let mut targets = Targets::default();
        targets.data.insert(4, limbo_target(4, "rooms/gone"));
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_target_change(&targets, &WatchTargetChange::new(TargetChangeState::Current, vec![4]));

        let event = aggregator.create_remote_event(&targets, Timestamp::new(9, 0));
        let deleted = &event.document_updates[&key("rooms/gone")];
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), Timestamp::new(9, 0));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
    }

    #[test]
    fn documents_shared_with_listen_targets_are_not_limbo_resolved() {
        let mut targets = Targets::default();
        targets.data.insert(2, rooms_target(2));
        targets.data.insert(4, limbo_target(4, "rooms/a"));
        let mut aggregator = WatchChangeAggregator::new(serializer());
        let mut change = added(2, doc("rooms/a", 1));
        change.updated_target_ids.push(4);
        aggregator.handle_document_change(&targets, change);

        let event = aggregator.create_remote_event(&targets, Timestamp::new(1, 0));
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
