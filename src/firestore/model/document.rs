use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Placeholder for a key whose state is not known locally.
    Invalid,
    FoundDocument,
    /// The server confirmed the document does not exist at `version`.
    NoDocument,
    /// A committed write touched the document but its contents are unknown.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as tracked by the local cache, including absent and unknown states.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: Timestamp,
    read_time: Timestamp,
    create_time: Timestamp,
    data: MapValue,
    document_state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: Timestamp::MIN,
            read_time: Timestamp::MIN,
            create_time: Timestamp::MIN,
            data: MapValue::empty(),
            document_state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: Timestamp, data: MapValue) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: Timestamp) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: Timestamp) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub fn convert_to_found_document(&mut self, version: Timestamp, data: MapValue) -> &mut Self {
        // A recreated document keeps the create time of the version that introduced it.
        if self.create_time.is_min()
            && (self.document_type == DocumentType::Invalid
                || self.document_type == DocumentType::NoDocument)
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: Timestamp) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: Timestamp) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = Timestamp::MIN;
        self
    }

    pub fn set_read_time(&mut self, read_time: Timestamp) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: Timestamp) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> Timestamp {
        self.version
    }

    pub fn read_time(&self) -> Timestamp {
        self.read_time
    }

    pub fn create_time(&self) -> Timestamp {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.key.path().canonical_string().len() + self.data.approximate_byte_size() + 32
    }
}
