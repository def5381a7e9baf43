use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};

pub const DOCUMENT_KEY_FIELD: &str = "__name__";

/// Dot separated path to a field inside a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> FirestoreResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(invalid_argument(
                "FieldPath must contain only non-empty segments",
            ));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    pub fn document_id() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_FIELD.to_string()],
        }
    }

    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_FIELD
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_segment(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or_default()
    }

    pub fn last_segment(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Parent path, or `None` for single segment paths.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let segments = Vec::<String>::deserialize(deserializer)?;
        FieldPath::new(segments).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dot_path() {
        let field = FieldPath::from_dot_separated("address.city").unwrap();
        assert_eq!(field.segments(), &["address", "city"]);
        assert_eq!(field.parent().unwrap().canonical_string(), "address");
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(FieldPath::from_dot_separated("").is_err());
        assert!(FieldPath::from_dot_separated("a..b").is_err());
    }

    #[test]
    fn recognises_key_field() {
        assert!(FieldPath::document_id().is_key_field());
        assert!(!FieldPath::from_dot_separated("name").unwrap().is_key_field());
    }
}
