use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{tables, MutationQueueMetadata, SchemaTables};
use crate::firestore::model::{
    DocumentKey, Mutation, MutationBatch, Timestamp, User, BATCH_ID_UNKNOWN,
};

/// Per-user queue of locally committed but unacknowledged mutation batches.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_key: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.to_key(),
        }
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> MutationQueueMetadata {
        txn.tables()
            .mutation_queues
            .get(&self.user_key)
            .cloned()
            .unwrap_or_default()
    }

    fn batches<'t>(&self, tables: &'t SchemaTables) -> impl Iterator<Item = &'t MutationBatch> + 't {
        let user = self.user_key.clone();
        tables
            .mutations
            .range((user.clone(), i32::MIN)..=(user, i32::MAX))
            .map(|(_, batch)| batch)
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> bool {
        self.batches(txn.tables()).next().is_none()
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id = txn.tables().highest_batch_id + 1;
        txn.replace(tables::highest_batch_id, batch_id)?;
        if !txn.tables().mutation_queues.contains_key(&self.user_key) {
            txn.put(
                tables::mutation_queues,
                self.user_key.clone(),
                MutationQueueMetadata {
                    last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                    last_stream_token: Vec::new(),
                },
            )?;
        }
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            txn.put(
                tables::document_mutations,
                (self.user_key.clone(), mutation.key.clone(), batch_id),
                (),
            )?;
            add_to_collection_parent_index(txn, &mutation.key.collection_path())?;
        }
        txn.put(
            tables::mutations,
            (self.user_key.clone(), batch_id),
            batch.clone(),
        )?;
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: i32,
    ) -> Option<MutationBatch> {
        txn.tables()
            .mutations
            .get(&(self.user_key.clone(), batch_id))
            .cloned()
    }

    /// First batch with an id strictly greater than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: i32,
    ) -> Option<MutationBatch> {
        let start = batch_id.saturating_add(1);
        txn.tables()
            .mutations
            .range((self.user_key.clone(), start)..=(self.user_key.clone(), i32::MAX))
            .map(|(_, batch)| batch.clone())
            .next()
    }

    pub fn highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> i32 {
        self.batches(txn.tables())
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> Vec<MutationBatch> {
        self.batches(txn.tables()).cloned().collect()
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        self.all_mutation_batches_affecting_document_keys(txn, &BTreeSet::from([key.clone()]))
    }

    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let tables = txn.tables();
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let start = (self.user_key.clone(), key.clone(), i32::MIN);
            let end = (self.user_key.clone(), key.clone(), i32::MAX);
            batch_ids.extend(
                tables
                    .document_mutations
                    .range(start..=end)
                    .map(|((_, _, batch_id), _)| *batch_id),
            );
        }
        self.load_batches(tables, batch_ids)
    }

    /// Batches touching documents directly inside the query's collection, or
    /// any collection with the query's id for collection group queries.
    pub fn all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Vec<MutationBatch> {
        let tables = txn.tables();
        if let Some(collection_id) = query.collection_group_id() {
            let start = (self.user_key.clone(), DocumentKey::empty(), i32::MIN);
            let batch_ids = tables
                .document_mutations
                .range(start..)
                .take_while(|((user, _, _), _)| *user == self.user_key)
                .filter(|((_, key, _), _)| key.has_collection_id(collection_id))
                .map(|((_, _, batch_id), _)| *batch_id)
                .collect();
            return self.load_batches(tables, batch_ids);
        }
        let prefix = query.path();
        let start = (
            self.user_key.clone(),
            DocumentKey::range_start(prefix),
            i32::MIN,
        );
        let mut batch_ids = BTreeSet::new();
        for ((user, key, batch_id), _) in tables.document_mutations.range(start..) {
            if *user != self.user_key || !prefix.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() == prefix.len() + 1 {
                batch_ids.insert(*batch_id);
            }
        }
        self.load_batches(tables, batch_ids)
    }

    fn load_batches(&self, tables: &SchemaTables, batch_ids: BTreeSet<i32>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| {
                tables
                    .mutations
                    .get(&(self.user_key.clone(), batch_id))
                    .cloned()
            })
            .collect()
    }

    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let oldest = self.batches(txn.tables()).next().map(|b| b.batch_id);
        if oldest != Some(batch.batch_id) {
            return Err(internal_error(format!(
                "Can only remove the oldest batch of the queue, got {} (oldest {:?})",
                batch.batch_id, oldest
            )));
        }
        txn.delete(tables::mutations, &(self.user_key.clone(), batch.batch_id))?;
        let sequence_number = txn.current_sequence_number()?;
        for key in batch.keys() {
            txn.delete(
                tables::document_mutations,
                &(self.user_key.clone(), key.clone(), batch.batch_id),
            )?;
            // The document may now be collectable.
            txn.put(tables::document_sequence_numbers, key, sequence_number)?;
        }
        Ok(())
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let metadata = MutationQueueMetadata {
            last_acknowledged_batch_id: batch.batch_id,
            last_stream_token: stream_token,
        };
        txn.put(tables::mutation_queues, self.user_key.clone(), metadata)
    }

    pub fn last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> Vec<u8> {
        self.metadata(txn).last_stream_token
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn);
        metadata.last_stream_token = stream_token;
        txn.put(tables::mutation_queues, self.user_key.clone(), metadata)
    }

    /// An empty queue must not leave document references behind.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if !self.check_empty(txn) {
            return Ok(());
        }
        let tables = txn.tables();
        let start = (self.user_key.clone(), DocumentKey::empty(), i32::MIN);
        let dangling: Vec<&DocumentKey> = tables
            .document_mutations
            .range(start..)
            .take_while(|((user, _, _), _)| *user == self.user_key)
            .map(|((_, key, _), _)| key)
            .collect();
        if dangling.is_empty() {
            Ok(())
        } else {
            Err(internal_error(format!(
                "Document leak: mutation queue for '{}' is empty but {} document references remain",
                self.user_key,
                dangling.len()
            )))
        }
    }
}

/// True when any user's queue still references `key`.
pub(crate) fn any_queue_contains_key(tables: &SchemaTables, key: &DocumentKey) -> bool {
    tables.mutation_queues.keys().any(|user| {
        let start = (user.clone(), key.clone(), i32::MIN);
        let end = (user.clone(), key.clone(), i32::MAX);
        tables.document_mutations.range(start..=end).next().is_some()
    })
}
