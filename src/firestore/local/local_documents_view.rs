use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, IndexOffset, MutableDocument, MutationKind,
    Overlay, OverlayedDocument, Timestamp, BATCH_ID_UNKNOWN,
};

/// Bookkeeping for the automatic index heuristic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    /// Documents loaded from the cache while answering one query.
    pub documents_read_count: usize,
}

/// A page of local documents handed to the index backfiller.
#[derive(Clone, Debug, Default)]
pub struct NextDocuments {
    /// Largest batch id among the overlays folded into `documents`.
    pub batch_id: i32,
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
}

/// Merges the remote document cache with the overlays of pending writes.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlays: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlay_cache(&self) -> &DocumentOverlayCache {
        &self.overlays
    }

    /// Local view of one document; invalid when neither cached nor written locally.
    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        let mut document = self.remote_documents.get_entry(txn, key);
        if let Some(overlay) = self.overlays.get_overlay(txn, key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, None, Timestamp::now());
        }
        document
    }

    pub fn get_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let documents = self.remote_documents.get_entries(txn, keys);
        let overlayed = self.get_local_view_of_documents(txn, documents, &BTreeSet::new())?;
        Ok(overlayed
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Local view of the given remote documents together with the fields their
    /// overlays touched.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let documents = self.remote_documents.get_entries(txn, keys);
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed` whose
    /// overlay might now apply differently have their overlays recomputed.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays.get_overlays(txn, documents.keys());
        self.compute_views(txn, documents, overlays, existence_state_changed)
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = BTreeMap::new();
        let mut results = BTreeMap::new();
        let now = Timestamp::now();
        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let patch_or_absent = overlay.map_or(true, |overlay| {
                matches!(overlay.mutation.kind, MutationKind::Patch { .. })
            });
            if existence_state_changed.contains(&key) && patch_or_absent {
                recalculate.insert(key, document);
                continue;
            }
            let mut mutated_fields = None;
            if let Some(overlay) = overlay {
                mutated_fields = overlay.mutation.field_mask();
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, mutated_fields.clone(), now);
            }
            results.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }

        let masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        for (key, document) in recalculate {
            let mutated_fields = masks.get(&key).cloned().flatten();
            results.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }
        Ok(results)
    }

    /// Replays every pending batch over `documents` in batch order, leaving the
    /// local view in `documents`, and stores one overlay per key under the
    /// highest batch that touched it. Returns the mutated fields per key.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(txn, &keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<i32, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(key), masks.get(key)) else {
                    continue;
                };
                overlays.insert(key.clone(), calculate_overlay_mutation(document, mask.as_ref()));
            }
            self.overlays.save_overlays(txn, *batch_id, &overlays)?;
        }

        // Keys no batch touches any more must not keep a stale overlay.
        let stale: BTreeMap<DocumentKey, Option<_>> = keys
            .difference(&processed)
            .filter(|key| self.overlays.get_overlay(txn, key).is_some())
            .map(|key| (key.clone(), None))
            .collect();
        if !stale.is_empty() {
            self.overlays.save_overlays(txn, 0, &stale)?;
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Up to `count` documents of `collection_group` changed after `offset`,
    /// topped up with locally mutated documents when the remote cache runs
    /// short.
    pub fn get_next_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<NextDocuments> {
        let mut documents = self
            .remote_documents
            .get_all_from_collection_group(txn, collection_group, offset, count);
        let remaining = count.saturating_sub(documents.len());
        let mut overlays = if remaining > 0 {
            self.overlays.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                remaining,
            )
        } else {
            BTreeMap::new()
        };

        let mut batch_id = BATCH_ID_UNKNOWN;
        for (key, overlay) in &overlays {
            if !documents.contains_key(key) {
                let base = if matches!(overlay.mutation.kind, MutationKind::Patch { .. }) {
                    self.remote_documents.get_entry(txn, key)
                } else {
                    MutableDocument::new_invalid_document(key.clone())
                };
                documents.insert(key.clone(), base);
            }
            batch_id = batch_id.max(overlay.largest_batch_id);
        }

        let missing: Vec<DocumentKey> = documents
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.overlays.get_overlays(txn, missing.iter()));
        let views = self.compute_views(txn, documents, overlays, &BTreeSet::new())?;
        Ok(NextDocuments {
            batch_id,
            documents: views
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect(),
        })
    }

    /// Local view of every document matching `query` that changed after `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
                return BTreeMap::new();
            };
            let document = self.get_document(txn, &key);
            context.documents_read_count += 1;
            return if document.is_found_document() {
                BTreeMap::from([(key, document)])
            } else {
                BTreeMap::new()
            };
        }
        if let Some(collection_group) = query.collection_group_id() {
            let mut results = BTreeMap::new();
            for parent in self.index_manager.get_collection_parents(txn, collection_group) {
                let collection_query = query.as_collection_query_at_path(parent.child([collection_group]));
                results.extend(self.get_documents_matching_collection_query(txn, &collection_query, offset, context));
            }
            return results;
        }
        self.get_documents_matching_collection_query(txn, query, offset, context)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self
            .overlays
            .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id);
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self
            .remote_documents
            .get_documents_matching_query(txn, query, offset, &mutated_keys, context);
        for key in &mutated_keys {
            documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let now = Timestamp::now();
        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, None, now);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, Mutation, ResourcePath, User};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn view() -> LocalDocumentsView {
        let user = User::unauthenticated();
        LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MutationQueue::new(&user),
            DocumentOverlayCache::new(&user),
            IndexManager::new(),
        )
    }

    fn map(name: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(name).unwrap(), FirestoreValue::from_integer(value));
        data
    }

    #[test]
    fn overlays_fold_set_and_patch() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let view = view();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let set = Mutation::set(key.clone(), map("x", 1));
                let patch = Mutation::patch(
                    key.clone(),
                    map("y", 2),
                    FieldMask::new([FieldPath::from_dot_separated("y").unwrap()]),
                );
                view.mutation_queue().add_mutation_batch(txn, Timestamp::now(), vec![], vec![set])?;
                view.mutation_queue().add_mutation_batch(txn, Timestamp::now(), vec![], vec![patch])?;
                let keys = BTreeSet::from([key.clone()]);
                view.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;

                let overlay = view.overlay_cache().get_overlay(txn, &key).unwrap();
                assert_eq!(overlay.largest_batch_id, 2);
                assert!(matches!(overlay.mutation.kind, MutationKind::Set { .. }));

                let document = view.get_document(txn, &key);
                assert!(document.has_local_mutations());
                assert!(document.version().is_min());
                assert_eq!(document.data(), &{
                    let mut expected = map("x", 1);
                    expected.set(&FieldPath::from_dot_separated("y").unwrap(), FirestoreValue::from_integer(2));
                    expected
                });

                let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap();
                let mut context = QueryContext::default();
                let matches = view.get_documents_matching_query(txn, &query, &IndexOffset::none(), &mut context);
                assert_eq!(matches.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
