use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first so that consumers can replay changes in place.
    fn sort_order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

/// Collects the changes of one view computation, folding repeated changes to
/// the same key.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                log::error!("unsupported view change combination {old_type:?} then {new_type:?} for {key}");
                Some(change)
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Documents of a view kept in query order, with lookup by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Query,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(query: &Query) -> Self {
        Self {
            query: query.clone(),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.query.compare_documents(left, right)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let position = self
            .sorted
            .binary_search_by(|candidate| self.query.compare_documents(candidate, &document))
            .unwrap_or_else(|position| position);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        match self
            .sorted
            .binary_search_by(|candidate| self.query.compare_documents(candidate, &existing))
        {
            Ok(position) => {
                self.sorted.remove(position);
            }
            Err(_) => self.sorted.retain(|document| document.key() != key),
        }
        Some(existing)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

/// The state of a query view delivered to listeners.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub changes: Vec<DocumentViewChange>,
    /// Keys of documents in the view with pending local writes.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// Whether the target was resumed with a resume token.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Self {
            old_documents: DocumentSet::new(&query),
            query,
            documents,
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Keys added to and removed from the view by this snapshot.
    pub(crate) fn added_and_removed_keys(&self) -> (BTreeSet<DocumentKey>, BTreeSet<DocumentKey>) {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in &self.changes {
            match change.change_type {
                ChangeType::Added => {
                    added.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        (added, removed)
    }

    pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], documents: &DocumentSet) {
        changes.sort_by(|left, right| {
            left.change_type
                .sort_order()
                .cmp(&right.change_type.sort_order())
                .then_with(|| documents.compare(&left.document, &right.document))
        });
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.documents == other.documents
            && self.old_documents == other.old_documents
            && self.changes == other.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ResourcePath, Timestamp};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            Timestamp::new(version, 0),
            MapValue::empty(),
        )
    }

    fn change(change_type: ChangeType, document: MutableDocument) -> DocumentViewChange {
        DocumentViewChange { change_type, document }
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1)));
        set.track(change(ChangeType::Removed, doc("rooms/a", 1)));
        assert!(set.is_empty());
    }

    #[test]
    fn remove_then_add_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, doc("rooms/a", 1)));
        set.track(change(ChangeType::Added, doc("rooms/a", 2)));
        let changes = set.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(changes[0].document.version(), Timestamp::new(2, 0));
    }

    #[test]
    fn metadata_after_added_stays_added() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1)));
        set.track(change(ChangeType::Metadata, doc("rooms/a", 2)));
        assert_eq!(set.changes()[0].change_type, ChangeType::Added);
        assert_eq!(set.changes()[0].document.version(), Timestamp::new(2, 0));
    }

    #[test]
    fn document_set_orders_by_key_and_replaces() {
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap();
        let mut set = DocumentSet::new(&query);
        set.insert(doc("rooms/c", 1));
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 1));
        set.insert(doc("rooms/a", 2));
        let keys: Vec<String> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b", "rooms/c"]);
        assert_eq!(set.get(&DocumentKey::from_string("rooms/a").unwrap()).unwrap().version(), Timestamp::new(2, 0));
        set.remove(&DocumentKey::from_string("rooms/b").unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set.last().unwrap().key().to_string(), "rooms/c");
    }
}
