use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::tables;
use crate::firestore::model::{DocumentKey, Mutation, Overlay, ResourcePath, User};

/// Folded local view of each document's pending writes, per user.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_key: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.to_key(),
        }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Option<Overlay> {
        txn.tables()
            .overlays
            .get(&(self.user_key.clone(), key.clone()))
            .cloned()
    }

    pub fn get_overlays<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.into_iter()
            .filter_map(|key| {
                self.get_overlay(txn, key)
                    .map(|overlay| (key.clone(), overlay))
            })
            .collect()
    }

    fn remove_overlay(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let row = (self.user_key.clone(), key.clone());
        if let Some(existing) = txn.tables().overlays.get(&row).cloned() {
            txn.delete(tables::overlays, &row)?;
            txn.delete(
                tables::overlays_by_batch,
                &(self.user_key.clone(), existing.largest_batch_id, key.clone()),
            )?;
        }
        Ok(())
    }

    /// Replaces the overlay of every key in `overlays`. A `None` entry removes it.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: i32,
        overlays: &BTreeMap<DocumentKey, Option<Mutation>>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            self.remove_overlay(txn, key)?;
            if let Some(mutation) = mutation {
                txn.put(
                    tables::overlays,
                    (self.user_key.clone(), key.clone()),
                    Overlay::new(largest_batch_id, mutation.clone()),
                )?;
                txn.put(
                    tables::overlays_by_batch,
                    (self.user_key.clone(), largest_batch_id, key.clone()),
                    (),
                )?;
            }
        }
        Ok(())
    }

    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document_keys: &BTreeSet<DocumentKey>,
        batch_id: i32,
    ) -> FirestoreResult<()> {
        for key in document_keys {
            let matches = self
                .get_overlay(txn, key)
                .is_some_and(|overlay| overlay.largest_batch_id == batch_id);
            if matches {
                self.remove_overlay(txn, key)?;
            }
        }
        Ok(())
    }

    /// Overlays for documents directly inside `collection` written after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = (self.user_key.clone(), DocumentKey::range_start(collection));
        txn.tables()
            .overlays
            .range(start..)
            .take_while(|((user, key), _)| {
                *user == self.user_key && collection.is_prefix_of(key.path())
            })
            .filter(|((_, key), overlay)| {
                key.path().len() == collection.len() + 1 && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays for `collection_group` in batch order after `since_batch_id`.
    /// Stops after `count` overlays, but always finishes the batch it is in.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let tables = txn.tables();
        let start = (
            self.user_key.clone(),
            since_batch_id.saturating_add(1),
            DocumentKey::empty(),
        );
        let mut results = BTreeMap::new();
        let mut current_batch = None;
        for ((user, batch_id, key), _) in tables.overlays_by_batch.range(start..) {
            if *user != self.user_key {
                break;
            }
            if !key.has_collection_id(collection_group) {
                continue;
            }
            if results.len() >= count && current_batch != Some(*batch_id) {
                break;
            }
            current_batch = Some(*batch_id);
            if let Some(overlay) = tables.overlays.get(&(user.clone(), key.clone())) {
                results.insert(key.clone(), overlay.clone());
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(keys: &[&str]) -> BTreeMap<DocumentKey, Option<Mutation>> {
        keys.iter()
            .map(|path| (key(path), Some(Mutation::delete(key(path)))))
            .collect()
    }

    #[test]
    fn collection_group_reads_finish_the_current_batch() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        persistence
            .run_transaction("overlays", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a", "rooms/b"]))?;
                cache.save_overlays(txn, 2, &overlays(&["halls/c/rooms/d"]))?;
                cache.save_overlays(txn, 3, &overlays(&["other/e"]))?;

                let first = cache.get_overlays_for_collection_group(txn, "rooms", -1, 1);
                assert_eq!(first.len(), 2);
                let all = cache.get_overlays_for_collection_group(txn, "rooms", -1, 10);
                assert_eq!(all.len(), 3);
                let later = cache.get_overlays_for_collection(txn, &ResourcePath::from_string("rooms").unwrap(), 0);
                assert_eq!(later.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn remove_for_batch_keeps_newer_overlays() {
        let persistence: Box<dyn Persistence> = Box::new(MemoryPersistence::new("client"));
        let cache = DocumentOverlayCache::new(&User::unauthenticated());
        persistence
            .run_transaction("overlays", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a"]))?;
                cache.save_overlays(txn, 2, &overlays(&["rooms/b"]))?;
                let keys: BTreeSet<_> = [key("rooms/a"), key("rooms/b")].into_iter().collect();
                cache.remove_overlays_for_batch_id(txn, &keys, 1)?;
                assert!(cache.get_overlay(txn, &key("rooms/a")).is_none());
                assert_eq!(cache.get_overlay(txn, &key("rooms/b")).map(|o| o.largest_batch_id), Some(2));
                assert!(txn.tables().overlays_by_batch.len() == 1);
                Ok(())
            })
            .unwrap();
    }
}
