use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash separated path to a collection or document, relative to the database root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(segments.into_iter().map(Into::into).collect())
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Ok(Self::root());
        }
        if path.contains("//") {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(
            path.split('/').filter(|segment| !segment.is_empty()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.segments.clone();
        next.extend(segments.into_iter().map(Into::into));
        Self::new(next)
    }

    pub fn without_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self::new(segments)
    }

    pub fn pop_first_n(&self, count: usize) -> Self {
        if count >= self.segments.len() {
            return Self::root();
        }
        Self::new(self.segments[count..].to_vec())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.len() <= other.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    /// Even-length non-empty paths address documents.
    pub fn is_document_path(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        for (l, r) in left.segments.iter().zip(right.segments.iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        left.len().cmp(&right.len())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(Vec::<String>::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("1"));
        assert!(path.is_document_path());
        assert_eq!(path.canonical_string(), "rooms/eros/messages/1");
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("rooms//eros").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn orders_segment_wise() {
        let parent = ResourcePath::from_string("rooms/a").unwrap();
        let child = ResourcePath::from_string("rooms/a/messages/1").unwrap();
        let sibling = ResourcePath::from_string("rooms/b").unwrap();
        assert!(parent < child);
        assert!(child < sibling);
        assert!(parent.is_prefix_of(&child));
        assert!(!parent.is_immediate_parent_of(&child));
    }
}
