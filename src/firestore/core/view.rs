//! Client-side view of a single query.
//!
//! A view holds the documents currently matching its query and diffs every
//! batch of changed documents from the local store against them. It also
//! tracks which documents the backend has confirmed for the target, and
//! derives the set of limbo documents from the difference.

use std::collections::BTreeSet;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, ViewSnapshot,
};
use crate::firestore::local::local_store::{DocumentMap, QueryResult};
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    None,
    /// Results come from the cache or contain limbo documents.
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`]; feed it back to the same view
/// through [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limited query dropped documents at its edge; the caller must rerun
    /// the query against the local store and pass the result back in.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

pub struct View {
    query: Query,
    sync_state: SyncState,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reported for the target, as of the last change.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            document_set: DocumentSet::new(&query),
            query,
            sync_state: SyncState::None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_keys(&self) -> BTreeSet<DocumentKey> {
        self.document_set.keys().cloned().collect()
    }

    /// Diffs `changed` against the view. When `previous` is given the diff
    /// continues from that result instead of the view's applied state.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        // Documents at the edge of a full limit decide whether a change can
        // pull in something that is not cached in the view.
        let limit = self.query.limit().map(|limit| limit as usize);
        let full = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if full => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if full => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changed {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.query.compare_documents(new_doc, last).is_gt());
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.query.compare_documents(new_doc, first).is_lt());
                            if past_last || before_first {
                                // The document moved past the limit edge; a
                                // cached document may take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let dropped = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(dropped) = dropped else {
                    break;
                };
                document_set.remove(dropped.key());
                mutated_keys.remove(dropped.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: dropped,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Commits `doc_changes` and the target change to the view. Produces a
    /// snapshot unless nothing visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        ViewSnapshot::sort_changes(&mut changes, &self.document_set);

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: doc_changes.document_set,
            old_documents,
            changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Marks the view as not current when the client goes offline so the
    /// next snapshot is raised from cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Replaces the synced keys and documents with a fresh query result read
    /// from persistence, which another client context may have changed.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents.clear();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    /// Snapshot of the whole view as if every document were just added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == SyncState::Local,
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not known to be synced");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    /// A cached document the backend did not confirm is in limbo, unless a
    /// local write explains its presence.
    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A locally modified document whose write was just committed keeps its
/// local state until the backend sends the document itself.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ResourcePath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64, n: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        MutableDocument::new_found_document(key(path), Timestamp::new(version, 0), data)
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
    }

    fn docs(documents: &[MutableDocument]) -> DocumentMap {
        documents
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: b"token".to_vec(),
            current: true,
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    #[test]
    fn first_snapshot_is_from_cache_until_current() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(&[doc("rooms/a", 1, 1)]), None);
        let snapshot = view.apply_changes(changes, true, None, false).snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.changes[0].change_type, ChangeType::Added);

        let changes = view.compute_doc_changes(&DocumentMap::new(), None);
        let change = current_change(&["rooms/a"]);
        let snapshot = view.apply_changes(changes, true, Some(&change), false).snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.changes.is_empty());
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_when_current() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(&[doc("rooms/a", 1, 1), doc("rooms/b", 1, 2)]), None);
        let change = current_change(&["rooms/a"]);
        let result = view.apply_changes(changes, true, Some(&change), false);
        assert_eq!(result.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(result.snapshot.unwrap().from_cache);

        let mut removal = current_change(&[]);
        removal.resume_token.clear();
        let mut deleted = MutableDocument::new_no_document(key("rooms/b"), Timestamp::new(2, 0));
        deleted.set_read_time(Timestamp::new(2, 0));
        let changes = view.compute_doc_changes(&docs(&[deleted]), None);
        let result = view.apply_changes(changes, true, Some(&removal), false);
        assert_eq!(result.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = result.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn limit_drops_documents_past_the_edge_and_requests_refill() {
        let query = rooms().with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        let changes =
            view.compute_doc_changes(&docs(&[doc("rooms/a", 1, 1), doc("rooms/b", 1, 2), doc("rooms/c", 1, 3)]), None);
        assert!(!changes.needs_refill);
        let snapshot = view.apply_changes(changes, false, None, false).snapshot.unwrap();
        let keys: Vec<String> = snapshot.documents.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);

        let mut deleted = MutableDocument::new_no_document(key("rooms/a"), Timestamp::new(2, 0));
        deleted.set_read_time(Timestamp::new(2, 0));
        let changes = view.compute_doc_changes(&docs(&[deleted]), None);
        assert!(changes.needs_refill);
    }

    #[test]
    fn pending_write_flip_is_a_metadata_change() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let mut local = doc("rooms/a", 0, 1);
        local.set_has_local_mutations();
        let changes = view.compute_doc_changes(&docs(&[local]), None);
        let snapshot = view.apply_changes(changes, false, None, false).snapshot.unwrap();
        assert!(snapshot.has_pending_writes());

        let synced = doc("rooms/a", 3, 1);
        let changes = view.compute_doc_changes(&docs(&[synced]), None);
        let snapshot = view.apply_changes(changes, false, None, false).snapshot.unwrap();
        assert_eq!(snapshot.changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn going_offline_raises_from_cache_snapshot() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let changes = view.compute_doc_changes(&docs(&[doc("rooms/a", 1, 1)]), None);
        let change = current_change(&["rooms/a"]);
        assert!(!view.apply_changes(changes, true, Some(&change), false).snapshot.unwrap().from_cache);

        let snapshot = view.apply_online_state_change(OnlineState::Offline).snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
