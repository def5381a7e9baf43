use std::collections::BTreeSet;

use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::tables;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, Timestamp};

/// Persisted targets and the documents each target is known to match.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<i32> {
        let mut globals = txn.tables().target_globals.clone();
        let target_id = TargetIdGenerator::for_target_cache(globals.highest_target_id).next();
        globals.highest_target_id = target_id;
        txn.replace(tables::target_globals, globals)?;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> Timestamp {
        txn.tables().target_globals.last_remote_snapshot_version
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> ListenSequenceNumber {
        txn.tables().target_globals.highest_listen_sequence_number
    }

    pub fn set_target_globals(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<Timestamp>,
    ) -> FirestoreResult<()> {
        let mut globals = txn.tables().target_globals.clone();
        globals.highest_listen_sequence_number =
            globals.highest_listen_sequence_number.max(highest_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            globals.last_remote_snapshot_version = version;
        }
        txn.replace(tables::target_globals, globals)
    }

    pub fn target_count(&self, txn: &PersistenceTransaction<'_>) -> u64 {
        txn.tables().target_globals.target_count
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        if txn.tables().targets.contains_key(&data.target_id) {
            return Err(internal_error(format!(
                "Target {} is already in the target cache",
                data.target_id
            )));
        }
        self.save_target_data(txn, data)?;
        let mut globals = txn.tables().target_globals.clone();
        globals.target_count += 1;
        globals.highest_target_id = globals.highest_target_id.max(data.target_id);
        txn.replace(tables::target_globals, globals)
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, data)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        txn.put(tables::targets, data.target_id, data.clone())?;
        txn.put(
            tables::target_canonical_ids,
            (data.target.canonical_id(), data.target_id),
            (),
        )?;
        self.set_target_globals(txn, data.sequence_number, None)
    }

    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_>, data: &TargetData) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, data.target_id)?;
        txn.delete(
            tables::target_canonical_ids,
            &(data.target.canonical_id(), data.target_id),
        )?;
        if txn.tables().targets.contains_key(&data.target_id) {
            txn.delete(tables::targets, &data.target_id)?;
            let mut globals = txn.tables().target_globals.clone();
            globals.target_count = globals.target_count.saturating_sub(1);
            txn.replace(tables::target_globals, globals)?;
        }
        Ok(())
    }

    /// Cached data for a target equal to `target`.
    pub fn get_target_data(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<TargetData> {
        let tables = txn.tables();
        let canonical_id = target.canonical_id();
        tables
            .target_canonical_ids
            .range((canonical_id.clone(), i32::MIN)..=(canonical_id, i32::MAX))
            .filter_map(|((_, target_id), _)| tables.targets.get(target_id))
            .find(|data| data.target == *target)
            .cloned()
    }

    pub fn get_target_data_by_id(&self, txn: &PersistenceTransaction<'_>, target_id: i32) -> Option<TargetData> {
        txn.tables().targets.get(&target_id).cloned()
    }

    pub fn all_targets(&self, txn: &PersistenceTransaction<'_>) -> Vec<TargetData> {
        txn.tables().targets.values().cloned().collect()
    }

    pub fn add_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number()?;
        for key in keys {
            txn.put(tables::target_documents, (target_id, key.clone()), ())?;
            txn.put(tables::document_targets, (key.clone(), target_id), ())?;
            txn.put(tables::document_sequence_numbers, key.clone(), sequence_number)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number()?;
        for key in keys {
            txn.delete(tables::target_documents, &(target_id, key.clone()))?;
            txn.delete(tables::document_targets, &(key.clone(), target_id))?;
            txn.put(tables::document_sequence_numbers, key.clone(), sequence_number)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: i32,
    ) -> FirestoreResult<()> {
        // Sequence numbers are left alone so the collector still sees how
        // recently each document was used.
        for key in self.get_matching_keys_for_target_id(txn, target_id) {
            txn.delete(tables::target_documents, &(target_id, key.clone()))?;
            txn.delete(tables::document_targets, &(key, target_id))?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: i32,
    ) -> BTreeSet<DocumentKey> {
        txn.tables()
            .target_documents
            .range((target_id, DocumentKey::empty())..)
            .take_while(|((id, _), _)| *id == target_id)
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// True when any target references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        txn.tables()
            .document_targets
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }

    /// Removes targets whose sequence number is at most `upper_bound` and that
    /// are not in `active_target_ids`. Returns the number removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<i32>,
    ) -> FirestoreResult<usize> {
        let doomed: Vec<TargetData> = txn
            .tables()
            .targets
            .values()
            .filter(|data| data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id))
            .cloned()
            .collect();
        for data in &doomed {
            self.remove_target_data(txn, data)?;
        }
        Ok(doomed.len())
    }
}
