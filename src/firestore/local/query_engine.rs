use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::{LocalDocumentsView, QueryContext};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, Timestamp};

/// Collections smaller than this are always scanned.
pub const DEFAULT_MIN_COLLECTION_SIZE_TO_AUTO_CREATE_INDEX: usize = 100;

/// Relative cost of reading one document through an index versus a full scan.
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    pub min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: DEFAULT_MIN_COLLECTION_SIZE_TO_AUTO_CREATE_INDEX,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

/// Picks the cheapest way to answer a query from the local cache: a client
/// index, the keys of the last limbo-free snapshot, or a collection scan.
///
/// Results may contain documents that no longer match; the view re-applies
/// filters, ordering and limits.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
    index_manager: IndexManager,
    auto_indexing: IndexAutoCreationSettings,
}

impl QueryEngine {
    pub fn new(
        local_documents: LocalDocumentsView,
        index_manager: IndexManager,
        auto_indexing: IndexAutoCreationSettings,
    ) -> Self {
        Self {
            local_documents,
            index_manager,
            auto_indexing,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.auto_indexing.enabled = enabled;
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: Timestamp,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        if let Some(results) = self.perform_query_using_index(txn, query) {
            return Ok(results);
        }
        if let Some(results) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok(results);
        }

        let mut context = QueryContext::default();
        let results = self.local_documents.get_documents_matching_query(
            txn,
            query,
            &IndexOffset::none(),
            &mut context,
        );
        if self.auto_indexing.enabled {
            self.create_cache_indexes(txn, query, &context, results.len())?;
        }
        Ok(results)
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let read = context.documents_read_count;
        if read < self.auto_indexing.min_collection_size {
            log::debug!(
                "skipping index creation for {}: only {read} documents read",
                query.canonical_id()
            );
            return Ok(());
        }
        let threshold = self.auto_indexing.relative_index_read_cost_per_document * result_size as f64;
        if read as f64 > threshold {
            log::debug!(
                "creating client indexes for {} ({read} documents read, {result_size} results)",
                query.canonical_id()
            );
            self.index_manager.create_target_indexes(txn, &query.to_target())?;
        }
        Ok(())
    }

    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if matches_all_documents(query) {
            return None;
        }
        let target = query.to_target();
        let index_type = self.index_manager.get_index_type(txn, &target);
        if index_type == IndexType::None {
            return None;
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // Candidates of a partial index may not match, so the limit
            // cannot be trusted.
            return self.perform_query_using_index(txn, &query.without_limit());
        }

        let keys = self.index_manager.get_documents_matching_target(txn, &target)?;
        let key_set: BTreeSet<DocumentKey> = keys.into_iter().collect();
        let documents = self.local_view_of(txn, &key_set);
        let offset = self.index_manager.get_min_offset(txn, &target);
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, &key_set, offset.read_time) {
            return self.perform_query_using_index(txn, &query.without_limit());
        }
        Some(self.append_remaining_results(txn, previous_results, query, &offset))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: Timestamp,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if matches_all_documents(query) || last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let documents = self.local_view_of(txn, remote_keys);
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version) {
            return None;
        }
        log::debug!(
            "re-using previous results for {} from version {:?}",
            query.canonical_id(),
            last_limbo_free_snapshot_version
        );
        let offset = IndexOffset {
            read_time: last_limbo_free_snapshot_version,
            document_key: DocumentKey::empty(),
            largest_batch_id: -1,
        };
        Some(self.append_remaining_results(txn, previous_results, query, &offset))
    }

    fn local_view_of(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutableDocument> {
        keys.iter()
            .map(|key| self.local_documents.get_document(txn, key))
            .collect()
    }

    /// Combines earlier results with everything that changed after `offset`.
    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction<'_>,
        previous_results: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut context = QueryContext::default();
        let mut remaining =
            self.local_documents
                .get_documents_matching_query(txn, query, offset, &mut context);
        for document in previous_results {
            remaining.insert(document.key().clone(), document);
        }
        remaining
    }
}

/// Queries without filters, cursors or limits read the whole collection anyway.
fn matches_all_documents(query: &Query) -> bool {
    query.filters().is_empty()
        && !query.has_limit()
        && query.start_at().is_none()
        && query.end_at().is_none()
        && query
            .explicit_order_by()
            .iter()
            .all(|order| order.field.is_key_field())
}

fn apply_query(query: &Query, documents: Vec<MutableDocument>) -> Vec<MutableDocument> {
    let mut results: Vec<MutableDocument> = documents
        .into_iter()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| query.compare_documents(left, right));
    results
}

/// True when a limit query's earlier results can no longer be trusted: a
/// previous match dropped out, or the document at the limit edge changed
/// after `limbo_free_snapshot_version`.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: Timestamp,
) -> bool {
    let Some(limit) = query.limit() else {
        return false;
    };
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    if sorted_previous_results.len() < limit as usize {
        return false;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
