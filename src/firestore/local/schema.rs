//! Tables backing every persistence implementation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::local::lease::{ClientMetadata, OwnerRecord};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, FieldIndex, ListenSequenceNumber, MutableDocument, MutationBatch, Overlay,
    ResourcePath, Timestamp,
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueMetadata {
    pub last_acknowledged_batch_id: i32,
    pub last_stream_token: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetGlobals {
    pub highest_target_id: i32,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: Timestamp,
    pub target_count: u64,
}

/// Per-segment encodings of one index entry, in index segment order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub segment_values: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaTables {
    pub schema_version: u32,
    pub highest_batch_id: i32,
    #[serde(with = "rows")]
    pub mutation_queues: BTreeMap<String, MutationQueueMetadata>,
    /// Keyed by (user, batch id).
    #[serde(with = "rows")]
    pub mutations: BTreeMap<(String, i32), MutationBatch>,
    /// Keyed by (user, document, batch id).
    #[serde(with = "rows")]
    pub document_mutations: BTreeMap<(String, DocumentKey, i32), ()>,
    #[serde(with = "rows")]
    pub remote_documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Keyed by (collection group, read time, document).
    #[serde(with = "rows")]
    pub remote_document_read_times: BTreeMap<(String, Timestamp, DocumentKey), ()>,
    #[serde(with = "rows")]
    pub targets: BTreeMap<i32, TargetData>,
    #[serde(with = "rows")]
    pub target_canonical_ids: BTreeMap<(String, i32), ()>,
    #[serde(with = "rows")]
    pub target_documents: BTreeMap<(i32, DocumentKey), ()>,
    #[serde(with = "rows")]
    pub document_targets: BTreeMap<(DocumentKey, i32), ()>,
    /// Last sequence number at which each document was touched.
    #[serde(with = "rows")]
    pub document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
    pub target_globals: TargetGlobals,
    /// Keyed by (user, document).
    #[serde(with = "rows")]
    pub overlays: BTreeMap<(String, DocumentKey), Overlay>,
    /// Keyed by (user, largest batch id, document).
    #[serde(with = "rows")]
    pub overlays_by_batch: BTreeMap<(String, i32, DocumentKey), ()>,
    /// Keyed by (collection id, parent path).
    #[serde(with = "rows")]
    pub collection_parents: BTreeMap<(String, ResourcePath), ()>,
    #[serde(with = "rows")]
    pub field_indexes: BTreeMap<i32, FieldIndex>,
    /// Keyed by (index id, concatenated segment encodings, document).
    #[serde(with = "rows")]
    pub index_entries: BTreeMap<(i32, Vec<u8>, DocumentKey), IndexEntry>,
    /// Reverse lookup of the encodings written for a document per index.
    #[serde(with = "rows")]
    pub document_index_entries: BTreeMap<(DocumentKey, i32), Vec<Vec<u8>>>,
    pub owner: Option<OwnerRecord>,
    #[serde(with = "rows")]
    pub client_metadata: BTreeMap<String, ClientMetadata>,
    /// Contexts that shut down, with the time they were marked. Their owner
    /// and metadata rows are ignored even while still fresh.
    #[serde(with = "rows")]
    pub zombied_clients: BTreeMap<String, i64>,
}

impl Default for SchemaTables {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            highest_batch_id: 0,
            mutation_queues: BTreeMap::new(),
            mutations: BTreeMap::new(),
            document_mutations: BTreeMap::new(),
            remote_documents: BTreeMap::new(),
            remote_document_read_times: BTreeMap::new(),
            targets: BTreeMap::new(),
            target_canonical_ids: BTreeMap::new(),
            target_documents: BTreeMap::new(),
            document_targets: BTreeMap::new(),
            document_sequence_numbers: BTreeMap::new(),
            target_globals: TargetGlobals::default(),
            overlays: BTreeMap::new(),
            overlays_by_batch: BTreeMap::new(),
            collection_parents: BTreeMap::new(),
            field_indexes: BTreeMap::new(),
            index_entries: BTreeMap::new(),
            document_index_entries: BTreeMap::new(),
            owner: None,
            client_metadata: BTreeMap::new(),
            zombied_clients: BTreeMap::new(),
        }
    }
}

impl SchemaTables {
    pub fn approximate_byte_size(&self) -> u64 {
        let documents: usize = self
            .remote_documents
            .values()
            .map(MutableDocument::approximate_byte_size)
            .sum();
        let rows = self.mutations.len()
            + self.targets.len()
            + self.target_documents.len()
            + self.overlays.len()
            + self.index_entries.len();
        (documents + rows * 64) as u64
    }
}

/// Accessors handed to [`PersistenceTransaction::put`](super::persistence::PersistenceTransaction::put).
pub mod tables {
    use super::*;

    pub fn mutation_queues(t: &mut SchemaTables) -> &mut BTreeMap<String, MutationQueueMetadata> {
        &mut t.mutation_queues
    }

    pub fn mutations(t: &mut SchemaTables) -> &mut BTreeMap<(String, i32), MutationBatch> {
        &mut t.mutations
    }

    pub fn document_mutations(
        t: &mut SchemaTables,
    ) -> &mut BTreeMap<(String, DocumentKey, i32), ()> {
        &mut t.document_mutations
    }

    pub fn remote_documents(t: &mut SchemaTables) -> &mut BTreeMap<DocumentKey, MutableDocument> {
        &mut t.remote_documents
    }

    pub fn remote_document_read_times(
        t: &mut SchemaTables,
    ) -> &mut BTreeMap<(String, Timestamp, DocumentKey), ()> {
        &mut t.remote_document_read_times
    }

    pub fn targets(t: &mut SchemaTables) -> &mut BTreeMap<i32, TargetData> {
        &mut t.targets
    }

    pub fn target_canonical_ids(t: &mut SchemaTables) -> &mut BTreeMap<(String, i32), ()> {
        &mut t.target_canonical_ids
    }

    pub fn target_documents(t: &mut SchemaTables) -> &mut BTreeMap<(i32, DocumentKey), ()> {
        &mut t.target_documents
    }

    pub fn document_targets(t: &mut SchemaTables) -> &mut BTreeMap<(DocumentKey, i32), ()> {
        &mut t.document_targets
    }

    pub fn document_sequence_numbers(
        t: &mut SchemaTables,
    ) -> &mut BTreeMap<DocumentKey, ListenSequenceNumber> {
        &mut t.document_sequence_numbers
    }

    pub fn target_globals(t: &mut SchemaTables) -> &mut TargetGlobals {
        &mut t.target_globals
    }

    pub fn highest_batch_id(t: &mut SchemaTables) -> &mut i32 {
        &mut t.highest_batch_id
    }

    pub fn overlays(t: &mut SchemaTables) -> &mut BTreeMap<(String, DocumentKey), Overlay> {
        &mut t.overlays
    }

    pub fn overlays_by_batch(t: &mut SchemaTables) -> &mut BTreeMap<(String, i32, DocumentKey), ()> {
        &mut t.overlays_by_batch
    }

    pub fn collection_parents(t: &mut SchemaTables) -> &mut BTreeMap<(String, ResourcePath), ()> {
        &mut t.collection_parents
    }

    pub fn field_indexes(t: &mut SchemaTables) -> &mut BTreeMap<i32, FieldIndex> {
        &mut t.field_indexes
    }

    pub fn index_entries(
        t: &mut SchemaTables,
    ) -> &mut BTreeMap<(i32, Vec<u8>, DocumentKey), IndexEntry> {
        &mut t.index_entries
    }

    pub fn document_index_entries(
        t: &mut SchemaTables,
    ) -> &mut BTreeMap<(DocumentKey, i32), Vec<Vec<u8>>> {
        &mut t.document_index_entries
    }

    pub fn owner(t: &mut SchemaTables) -> &mut Option<OwnerRecord> {
        &mut t.owner
    }

    pub fn client_metadata(t: &mut SchemaTables) -> &mut BTreeMap<String, ClientMetadata> {
        &mut t.client_metadata
    }

    pub fn zombied_clients(t: &mut SchemaTables) -> &mut BTreeMap<String, i64> {
        &mut t.zombied_clients
    }
}

/// Serializes maps with composite keys as a list of rows so they survive JSON.
mod rows {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let rows = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_survive_json() {
        let mut tables = SchemaTables::default();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        tables.target_documents.insert((2, key.clone()), ());
        tables
            .remote_document_read_times
            .insert(("rooms".into(), Timestamp::new(3, 0), key.clone()), ());

        let encoded = serde_json::to_string(&tables).unwrap();
        let decoded: SchemaTables = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.target_documents.contains_key(&(2, key)));
        assert_eq!(decoded.remote_document_read_times.len(), 1);
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn missing_tables_default_when_loading() {
        let decoded: SchemaTables = serde_json::from_str(r#"{"schema_version":1}"#).unwrap();
        assert!(decoded.mutations.is_empty());
    }
}
