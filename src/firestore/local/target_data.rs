use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::model::{ListenSequenceNumber, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter check could not resolve a mismatch.
    ExistenceFilterMismatchBloom,
    /// Resolves a single document whose existence is in doubt.
    LimboResolution,
}

/// Bookkeeping for an allocated target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: Timestamp,
    /// Last snapshot at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: Timestamp,
    pub resume_token: Vec<u8>,
    /// Documents the client believes match, sent with a resumed listen.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: i32,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: Timestamp::MIN,
            last_limbo_free_snapshot_version: Timestamp::MIN,
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// A new resume token clears any expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: Timestamp) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: Timestamp) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
