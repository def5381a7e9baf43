mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_index::{
    FieldIndex, IndexOffset, IndexSegment, IndexState, SegmentKind, INITIAL_SEQUENCE_NUMBER,
    UNKNOWN_INDEX_ID,
};
pub use field_path::{FieldPath, DOCUMENT_KEY_FIELD};
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use timestamp::Timestamp;
pub use user::User;

/// Monotonic counter stamped on targets and documents for LRU collection.
pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
