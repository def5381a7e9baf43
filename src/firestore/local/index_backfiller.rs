use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::firestore::error::{is_primary_lease_lost, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::{LocalDocumentsView, NextDocuments};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::IndexOffset;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_MAX_DOCUMENTS_TO_PROCESS: usize = 50;
const INITIAL_BACKFILL_DELAY: Duration = Duration::from_secs(15);
const REGULAR_BACKFILL_DELAY: Duration = Duration::from_secs(60);

/// Writes index entries for documents cached before their index existed.
#[derive(Clone, Debug)]
pub struct IndexBackfiller {
    max_documents_to_process: usize,
}

impl Default for IndexBackfiller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENTS_TO_PROCESS)
    }
}

impl IndexBackfiller {
    pub fn new(max_documents_to_process: usize) -> Self {
        Self {
            max_documents_to_process,
        }
    }

    pub fn max_documents_to_process(&self) -> usize {
        self.max_documents_to_process
    }

    /// Indexes up to the configured number of documents, visiting the least
    /// recently backfilled collection groups first. Returns how many
    /// documents were processed.
    pub fn write_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents_view: &LocalDocumentsView,
        index_manager: &IndexManager,
    ) -> FirestoreResult<usize> {
        let mut processed_groups = BTreeSet::new();
        let mut remaining = self.max_documents_to_process;
        while remaining > 0 {
            let Some(collection_group) = index_manager.get_next_collection_group_to_update(txn) else {
                break;
            };
            if !processed_groups.insert(collection_group.clone()) {
                break;
            }
            log::debug!("processing collection group {collection_group}");
            let processed = self.write_entries_for_collection_group(
                txn,
                documents_view,
                index_manager,
                &collection_group,
                remaining,
            )?;
            remaining = remaining.saturating_sub(processed);
        }
        Ok(self.max_documents_to_process - remaining)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents_view: &LocalDocumentsView,
        index_manager: &IndexManager,
        collection_group: &str,
        limit: usize,
    ) -> FirestoreResult<usize> {
        let existing = index_manager.get_min_offset_for_collection_group(txn, collection_group);
        let next = documents_view.get_next_documents(txn, collection_group, &existing, limit)?;
        index_manager.update_index_entries(txn, &next.documents)?;
        let offset = new_offset(&existing, &next);
        log::debug!(
            "updating offset of collection group {collection_group} to {:?}/{}",
            offset.read_time,
            offset.document_key
        );
        index_manager.update_collection_group(txn, collection_group, offset)?;
        Ok(next.documents.len())
    }
}

fn new_offset(existing: &IndexOffset, next: &NextDocuments) -> IndexOffset {
    let mut max = existing.clone();
    for document in next.documents.values() {
        let candidate = IndexOffset::from_document(document);
        if candidate > max {
            max = candidate;
        }
    }
    IndexOffset {
        largest_batch_id: next.batch_id.max(existing.largest_batch_id),
        ..max
    }
}

/// Runs the backfiller on the async queue while this context is primary.
#[derive(Clone)]
pub struct IndexBackfillerScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    backfiller: IndexBackfiller,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
    has_run: AtomicBool,
}

impl IndexBackfillerScheduler {
    pub fn new(backfiller: IndexBackfiller, local_store: Arc<LocalStore>, queue: AsyncQueue) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                backfiller,
                local_store,
                queue,
                task: Mutex::new(None),
                has_run: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        Self::schedule(&self.inner);
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.inner.task.lock() {
            if let Some(task) = task.take() {
                task.cancel();
            }
        }
    }

    fn schedule(inner: &Arc<SchedulerInner>) {
        let Ok(mut task) = inner.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        let delay = if inner.has_run.load(Ordering::SeqCst) {
            REGULAR_BACKFILL_DELAY
        } else {
            INITIAL_BACKFILL_DELAY
        };
        let weak = Arc::downgrade(inner);
        *task = Some(inner.queue.enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if let Ok(mut task) = inner.task.lock() {
                *task = None;
            }
            inner.has_run.store(true, Ordering::SeqCst);
            match inner.local_store.backfill_indexes(&inner.backfiller) {
                Ok(processed) => log::debug!("documents written to index: {processed}"),
                Err(err) if is_primary_lease_lost(&err) => {
                    log::debug!("ignoring lease loss during index backfill: {err}");
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
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{
        DocumentKey, FieldIndex, FieldPath, IndexSegment, MutableDocument, SegmentKind, Timestamp, User,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn document(path: &str, read_secs: i64, value: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
        let mut document =
            MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), Timestamp::new(1, 0), data);
        document.set_read_time(Timestamp::new(read_secs, 0));
        document
    }

    #[test]
    fn backfill_advances_offsets_in_pages() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let user = User::unauthenticated();
        let remote = RemoteDocumentCache::new();
        let index_manager = IndexManager::new();
        let view = LocalDocumentsView::new(
            remote,
            MutationQueue::new(&user),
            DocumentOverlayCache::new(&user),
            index_manager,
        );
        let backfiller = IndexBackfiller::new(2);
        persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| {
                for (i, path) in ["rooms/a", "rooms/b", "rooms/c"].iter().enumerate() {
                    let doc = document(path, i as i64 + 1, i as i64);
                    remote.add_entry(txn, &doc, doc.read_time())?;
                }
                let index = FieldIndex::new(
                    "rooms",
                    vec![IndexSegment::new(FieldPath::from_dot_separated("n").unwrap(), SegmentKind::Ascending)],
                );
                index_manager.add_field_index(txn, index)?;

                assert_eq!(backfiller.write_index_entries(txn, &view, &index_manager)?, 2);
                let offset = index_manager.get_min_offset_for_collection_group(txn, "rooms");
                assert_eq!(offset.read_time, Timestamp::new(2, 0));
                assert_eq!(offset.document_key, DocumentKey::from_string("rooms/b").unwrap());

                assert_eq!(backfiller.write_index_entries(txn, &view, &index_manager)?, 1);
                assert_eq!(backfiller.write_index_entries(txn, &view, &index_manager)?, 0);
                assert_eq!(txn.tables().index_entries.len(), 3);
                Ok(())
            })
            .unwrap();
    }
}
