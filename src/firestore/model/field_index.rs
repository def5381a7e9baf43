use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, Timestamp};
use crate::firestore::value::index_encoding::IndexDirection;

pub const UNKNOWN_INDEX_ID: i32 = -1;
/// Sequence number of an index that has never been backfilled.
pub const INITIAL_SEQUENCE_NUMBER: i64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SegmentKind {
    Ascending,
    Descending,
    Contains,
}

impl SegmentKind {
    pub fn direction(self) -> IndexDirection {
        match self {
            SegmentKind::Descending => IndexDirection::Descending,
            SegmentKind::Ascending | SegmentKind::Contains => IndexDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: SegmentKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: SegmentKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache up to which an index is complete.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: Timestamp,
    pub document_key: DocumentKey,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self {
            read_time: Timestamp::MIN,
            document_key: DocumentKey::empty(),
            largest_batch_id: -1,
        }
    }

    pub fn from_document(document: &MutableDocument) -> Self {
        Self {
            read_time: document.read_time(),
            document_key: document.key().clone(),
            largest_batch_id: -1,
        }
    }

    /// True when `document` was read after this offset.
    pub fn precedes(&self, document: &MutableDocument) -> bool {
        compare_offsets(
            (&self.read_time, &self.document_key),
            (&document.read_time(), document.key()),
        ) == Ordering::Less
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_offsets(
            (&self.read_time, &self.document_key),
            (&other.read_time, &other.document_key),
        )
        .then(self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

fn compare_offsets(left: (&Timestamp, &DocumentKey), right: (&Timestamp, &DocumentKey)) -> Ordering {
    left.0.cmp(right.0).then_with(|| left.1.cmp(right.1))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexState {
    /// Backfill round in which the index was last updated. Lower is older.
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            sequence_number: INITIAL_SEQUENCE_NUMBER,
            offset: IndexOffset::none(),
        }
    }
}

/// Client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub state: IndexState,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
            state: IndexState::default(),
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == SegmentKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != SegmentKind::Contains)
    }

    /// Compares definitions only, ignoring id and backfill state.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let a = IndexOffset {
            read_time: Timestamp::new(1, 0),
            document_key: DocumentKey::from_string("c/b").unwrap(),
            largest_batch_id: -1,
        };
        let b = IndexOffset {
            read_time: Timestamp::new(2, 0),
            document_key: DocumentKey::from_string("c/a").unwrap(),
            largest_batch_id: -1,
        };
        assert!(a < b);
        assert!(IndexOffset::none() < a);
    }
}
