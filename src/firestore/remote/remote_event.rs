use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, Timestamp};

/// Aggregated result of a batch of watch changes, raised once the backend
/// reports a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: Timestamp,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose existence filter did not match. They are re-listened
    /// from scratch with the recorded purpose.
    pub target_mismatches: BTreeMap<i32, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents that only limbo targets reported on.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Empty when the backend did not send a new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty() || !self.modified_documents.is_empty() || !self.removed_documents.is_empty()
    }
}
