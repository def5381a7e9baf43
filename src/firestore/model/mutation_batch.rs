use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    Timestamp,
};

pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A document together with the fields its local mutations changed.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` means the whole document was overwritten locally.
    pub mutated_fields: Option<FieldMask>,
}

/// Atomic group of mutations committed together, identified by a per-user batch id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Replays non-idempotent transforms against the values seen at write time.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies the acknowledged results for `document.key()`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key == *document.key() {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key == *document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected document and returns the overlay each now needs.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
    ) -> BTreeMap<DocumentKey, Option<Mutation>> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mask = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.clone(),
            );
            overlayed.mutated_fields = mask.clone();
            let overlay = calculate_overlay_mutation(&overlayed.document, mask.as_ref());
            overlays.insert(key, overlay);
        }
        overlays
    }
}

/// Backend acknowledgement of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: Timestamp,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each document was committed at.
    pub doc_versions: BTreeMap<DocumentKey, Timestamp>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: Timestamp,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Batch {} has {} mutations but {} results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key.clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![],
            vec![Mutation::set(key("rooms/a"), data("n", 1))],
        );
        assert!(MutationBatchResult::from(batch, Timestamp::new(1, 0), vec![], vec![]).is_err());
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![],
            vec![
                Mutation::set(key("rooms/a"), data("n", 1)),
                Mutation::delete(key("rooms/b")),
            ],
        );
        let mut documents = BTreeMap::new();
        for path in ["rooms/a", "rooms/b"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: MutableDocument::new_invalid_document(key(path)),
                    mutated_fields: Some(FieldMask::empty()),
                },
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents);
        assert!(matches!(
            overlays.get(&key("rooms/a")),
            Some(Some(Mutation { kind: crate::firestore::model::MutationKind::Set { .. }, .. }))
        ));
        assert!(documents[&key("rooms/b")].document.is_no_document());
    }
}
