//! Least-recently-used collection of cached targets and documents.
//!
//! Every target and every document touched by a transaction is stamped with
//! that transaction's listen sequence number. A collection pass picks a
//! cutoff sequence number at a percentile of everything cached and removes
//! inactive targets and orphaned documents at or below it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::firestore::error::{is_primary_lease_lost, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue::any_queue_contains_key;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::schema::tables;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Threshold value that turns collection off.
pub const LRU_COLLECTION_DISABLED: i64 = -1;
pub const LRU_MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const LRU_DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: LRU_DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

impl LruParams {
    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: LRU_COLLECTION_DISABLED,
            ..Self::default()
        }
    }

    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != LRU_COLLECTION_DISABLED
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            target_cache: TargetCache::new(),
            remote_documents: RemoteDocumentCache::new(),
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs a pass if the cache is over the threshold. Targets in
    /// `active_target_ids` and documents in `pinned` survive regardless of
    /// their sequence numbers.
    pub fn collect(
        &self,
        persistence: &dyn Persistence,
        active_target_ids: &BTreeSet<i32>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("garbage collection skipped; collection is disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = persistence.approximate_byte_size()?;
        if (cache_size as i64) < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::skipped());
        }
        persistence.run_transaction("collect garbage", TransactionMode::ReadWritePrimary, |txn| {
            self.run_collection(txn, active_target_ids, pinned)
        })
    }

    fn run_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<i32>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let count = self.calculate_target_count(txn, self.params.percentile_to_collect);
        let count = if count > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping garbage collection to {} sequence numbers (requested {count})",
                self.params.maximum_sequence_numbers_to_collect
            );
            self.params.maximum_sequence_numbers_to_collect
        } else {
            count
        };
        let Some(upper_bound) = self.nth_sequence_number(txn, count) else {
            return Ok(LruResults {
                did_run: true,
                ..LruResults::default()
            });
        };
        let targets_removed = self.target_cache.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pinned)?;
        log::debug!(
            "garbage collection up to sequence number {upper_bound} removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        })
    }

    /// Number of sequence numbers that make up `percentile` of the cache.
    pub fn calculate_target_count(&self, txn: &PersistenceTransaction<'_>, percentile: u32) -> usize {
        let total = self.sequence_numbers(txn).len();
        ((percentile as f64 / 100.0) * total as f64).floor() as usize
    }

    /// The `n`th smallest sequence number across targets and orphaned
    /// documents, or `None` when `n` is zero.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> Option<ListenSequenceNumber> {
        if n == 0 {
            return None;
        }
        let mut numbers = self.sequence_numbers(txn);
        numbers.sort_unstable();
        numbers.get(n - 1).copied()
    }

    fn sequence_numbers(&self, txn: &PersistenceTransaction<'_>) -> Vec<ListenSequenceNumber> {
        let tables = txn.tables();
        let mut numbers: Vec<ListenSequenceNumber> =
            tables.targets.values().map(|target| target.sequence_number).collect();
        numbers.extend(
            tables
                .document_sequence_numbers
                .iter()
                .filter(|(key, _)| !self.target_cache.contains_key(txn, key))
                .map(|(_, sequence_number)| *sequence_number),
        );
        numbers
    }

    fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let doomed: Vec<DocumentKey> = txn
            .tables()
            .document_sequence_numbers
            .iter()
            .filter(|(_, sequence_number)| **sequence_number <= upper_bound)
            .map(|(key, _)| key)
            .filter(|key| !self.is_pinned(txn, key, pinned))
            .cloned()
            .collect();
        for key in &doomed {
            self.remote_documents.remove_entry(txn, key)?;
            txn.delete(tables::document_sequence_numbers, key)?;
        }
        Ok(doomed.len())
    }

    fn is_pinned(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey, pinned: &ReferenceSet) -> bool {
        pinned.contains_key(key)
            || self.target_cache.contains_key(txn, key)
            || any_queue_contains_key(txn.tables(), key)
    }
}

/// Runs collection on the async queue while this context is primary.
#[derive(Clone)]
pub struct LruScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    collector: LruGarbageCollector,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
    has_run: AtomicBool,
}

impl LruScheduler {
    pub fn new(collector: LruGarbageCollector, local_store: Arc<LocalStore>, queue: AsyncQueue) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                collector,
                local_store,
                queue,
                task: Mutex::new(None),
                has_run: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.collector.params().is_enabled() {
            return;
        }
        Self::schedule(&self.inner);
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.inner.task.lock() {
            if let Some(task) = task.take() {
                task.cancel();
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .task
            .lock()
            .map(|task| task.is_some())
            .unwrap_or(false)
    }

    fn schedule(inner: &Arc<SchedulerInner>) {
        let Ok(mut task) = inner.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        let delay = if inner.has_run.load(Ordering::SeqCst) {
            REGULAR_GC_DELAY
        } else {
            INITIAL_GC_DELAY
        };
        log::debug!("garbage collection scheduled in {}s", delay.as_secs());
        let weak = Arc::downgrade(inner);
        *task = Some(inner.queue.enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if let Ok(mut task) = inner.task.lock() {
                *task = None;
            }
            inner.has_run.store(true, Ordering::SeqCst);
            match inner.local_store.collect_garbage(&inner.collector) {
                Ok(results) => log::debug!("garbage collection finished: {results:?}"),
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("ignoring lease loss during garbage collection: {err}");
                }
                Err(err) => return Err(err),
            }
            Self::schedule(&inner);
            Ok(())
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{MutableDocument, ResourcePath, Timestamp};
    use crate::firestore::value::MapValue;

    fn primary_persistence() -> Box<dyn Persistence> {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("gc"));
        persistence
            .run_transaction("claim", TransactionMode::ReadWrite, |txn| {
                txn.replace(
                    tables::owner,
                    Some(crate::firestore::local::lease::OwnerRecord {
                        owner_id: "gc".into(),
                        lease_timestamp_ms: 0,
                        allow_tab_synchronization: true,
                    }),
                )
            })
            .unwrap();
        persistence
    }

    fn add_target(persistence: &dyn Persistence, collection: &str, target_id: i32, docs: &[&str]) {
        let cache = TargetCache::new();
        let remote = RemoteDocumentCache::new();
        persistence
            .run_transaction("add target", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.current_sequence_number()?;
                let target = Query::collection(ResourcePath::from_string(collection).unwrap())
                    .unwrap()
                    .to_target();
                cache.add_target_data(txn, &TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number))?;
                let keys: Vec<DocumentKey> = docs.iter().map(|p| DocumentKey::from_string(p).unwrap()).collect();
                for key in &keys {
                    let doc = MutableDocument::new_found_document(key.clone(), Timestamp::new(1, 0), MapValue::empty());
                    remote.add_entry(txn, &doc, Timestamp::new(1, 0))?;
                }
                cache.add_matching_keys(txn, keys.iter(), target_id)
            })
            .unwrap();
    }

    #[test]
    fn disabled_collector_never_runs() {
        let persistence = primary_persistence();
        let gc = LruGarbageCollector::new(LruParams::disabled());
        let results = gc.collect(persistence.as_ref(), &BTreeSet::new(), &ReferenceSet::new()).unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn cache_below_threshold_is_left_alone() {
        let persistence = primary_persistence();
        add_target(persistence.as_ref(), "rooms", 2, &["rooms/a"]);
        let gc = LruGarbageCollector::new(LruParams::with_cache_size(LRU_DEFAULT_CACHE_SIZE_BYTES));
        let results = gc.collect(persistence.as_ref(), &BTreeSet::new(), &ReferenceSet::new()).unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn oldest_inactive_targets_and_their_documents_are_removed() {
        let persistence = primary_persistence();
        for i in 0..10 {
            let collection = format!("c{i}");
            let doc = format!("c{i}/doc");
            add_target(persistence.as_ref(), &collection, (i + 1) * 2, &[doc.as_str()]);
        }
        let params = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 20,
            maximum_sequence_numbers_to_collect: 1000,
        };
        let gc = LruGarbageCollector::new(params);
        let active: BTreeSet<i32> = [2].into_iter().collect();
        let results = gc.collect(persistence.as_ref(), &active, &ReferenceSet::new()).unwrap();
        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 2);
        // Target 2 is active, so only target 4 falls under the cutoff.
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);

        let cache = TargetCache::new();
        persistence
            .run_transaction("verify", TransactionMode::ReadOnly, |txn| {
                assert!(cache.get_target_data_by_id(txn, 2).is_some());
                assert!(cache.get_target_data_by_id(txn, 4).is_none());
                assert!(txn.tables().remote_documents.contains_key(&DocumentKey::from_string("c0/doc").unwrap()));
                assert!(!txn.tables().remote_documents.contains_key(&DocumentKey::from_string("c1/doc").unwrap()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn pinned_documents_survive_collection() {
        let persistence = primary_persistence();
        add_target(persistence.as_ref(), "rooms", 2, &["rooms/a"]);
        add_target(persistence.as_ref(), "halls", 4, &["halls/b"]);
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let mut pinned = ReferenceSet::new();
        pinned.add_reference(DocumentKey::from_string("rooms/a").unwrap(), 7);
        let results = gc.collect(persistence.as_ref(), &BTreeSet::new(), &pinned).unwrap();
        assert_eq!(results.targets_removed, 2);
        assert_eq!(results.documents_removed, 1);
    }
}
