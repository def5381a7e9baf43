use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::local_documents_view::QueryContext;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::tables;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, ResourcePath, Timestamp};

/// Last server-confirmed state of every cached document.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Writes `document` stamped with `read_time`.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document: &MutableDocument,
        read_time: Timestamp,
    ) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error(format!(
                "Cannot add document {} to the remote cache with a read time of zero",
                document.key()
            )));
        }
        let key = document.key().clone();
        self.remove_read_time_row(txn, &key)?;
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        txn.put(
            tables::remote_document_read_times,
            (key.collection_group().to_string(), read_time, key.clone()),
            (),
        )?;
        txn.put(tables::remote_documents, key.clone(), stored)?;
        add_to_collection_parent_index(txn, &key.collection_path())
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        self.remove_read_time_row(txn, key)?;
        txn.delete(tables::remote_documents, key)
    }

    fn remove_read_time_row(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let previous = txn
            .tables()
            .remote_documents
            .get(key)
            .map(|document| document.read_time());
        if let Some(read_time) = previous {
            txn.delete(
                tables::remote_document_read_times,
                &(key.collection_group().to_string(), read_time, key.clone()),
            )?;
        }
        Ok(())
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        txn.tables()
            .remote_documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `offset`.
    pub fn get_all_from_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        txn.tables()
            .remote_documents
            .range(DocumentKey::range_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, document)| {
                key.path().len() == collection.len() + 1 && offset.precedes(document)
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    /// Up to `limit` documents of `collection_group` in read-time order after `offset`.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let tables = txn.tables();
        let start = (
            collection_group.to_string(),
            offset.read_time,
            offset.document_key.clone(),
        );
        tables
            .remote_document_read_times
            .range(start..)
            .take_while(|((group, _, _), _)| group == collection_group)
            .filter(|((_, read_time, key), _)| {
                (*read_time, key) > (offset.read_time, &offset.document_key)
            })
            .filter_map(|((_, _, key), _)| {
                tables
                    .remote_documents
                    .get(key)
                    .map(|document| (key.clone(), document.clone()))
            })
            .take(limit)
            .collect()
    }

    /// Cached documents that match `query`, plus any key in `mutated_keys`
    /// whose local view may match once overlays are applied.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let candidates = match query.collection_group_id() {
            Some(collection_group) => self.get_all_from_collection_group(txn, collection_group, offset, usize::MAX),
            None => self.get_all_from_collection(txn, query.path(), offset),
        };
        context.documents_read_count += candidates.len();
        candidates
            .into_iter()
            .filter(|(key, document)| {
                mutated_keys.contains(key) || (document.is_found_document() && query.matches(document))
            })
            .collect()
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer {
            cache: *self,
            changes: BTreeMap::new(),
        }
    }
}

/// Staged remote document writes, applied in one step inside a transaction.
#[derive(Debug)]
pub struct RemoteDocumentChangeBuffer {
    cache: RemoteDocumentCache,
    /// Invalid documents mark removals.
    changes: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentChangeBuffer {
    /// Stages `document`; its read time must already be set.
    pub fn add_entry(&mut self, document: MutableDocument) {
        self.changes.insert(document.key().clone(), document);
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.changes
            .insert(key.clone(), MutableDocument::new_invalid_document(key.clone()));
    }

    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        match self.changes.get(key) {
            Some(document) => document.clone(),
            None => self.cache.get_entry(txn, key),
        }
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    pub fn apply(self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        for (key, document) in self.changes {
            if document.is_valid_document() {
                let read_time = document.read_time();
                self.cache.add_entry(txn, &document, read_time)?;
            } else {
                self.cache.remove_entry(txn, &key)?;
            }
        }
        Ok(())
    }
}
