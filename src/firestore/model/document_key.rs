use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid document key ({path}). Document keys must have an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Sorts before every real key. Only used as a range bound.
    pub(crate) fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// Smallest key that could live under `prefix`. Used as a range bound.
    pub(crate) fn range_start(prefix: &ResourcePath) -> Self {
        Self {
            path: prefix.clone(),
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection that directly contains this document.
    pub fn collection_group(&self) -> &str {
        self.path
            .len()
            .checked_sub(2)
            .and_then(|index| self.path.segment(index))
            .unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path.canonical_string())
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(DocumentKey::empty());
        }
        DocumentKey::from_string(&raw).map_err(serde::de::Error::custom)
    }
}
