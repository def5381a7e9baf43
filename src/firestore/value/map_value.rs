use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::FirestoreValue;

/// Document data: a map of top-level fields with nested maps addressed by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.as_map_mut() {
                Some(map) => &mut map.fields,
                None => return,
            };
        }
        current.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let segments = path.segments();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            current = match current.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => &mut map.fields,
                None => return,
            };
        }
        current.remove(last);
    }

    /// Every leaf path in the map. Empty nested maps count as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &[], &mut paths);
        paths
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + value_size(value))
            .sum()
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.as_map() {
            Some(nested) if !nested.is_empty() => collect_leaf_paths(&nested.fields, &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

fn value_size(value: &FirestoreValue) -> usize {
    use crate::firestore::value::ValueKind;
    match value.kind() {
        ValueKind::Null => 4,
        ValueKind::Boolean(_) => 4,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) => 16,
        ValueKind::String(s) => s.len() + 2,
        ValueKind::Bytes(b) => b.as_slice().len(),
        ValueKind::Reference(r) => r.len() + 2,
        ValueKind::Array(array) => array.values().iter().map(value_size).sum(),
        ValueKind::Map(map) => map.approximate_byte_size(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut map = MapValue::empty();
        map.set(&path("address.city"), FirestoreValue::from_string("Lisbon"));
        assert_eq!(
            map.get(&path("address.city")),
            Some(&FirestoreValue::from_string("Lisbon"))
        );
        assert!(map.get(&path("address.zip")).is_none());
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn delete_removes_nested_field() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        map.set(&path("a.c"), FirestoreValue::from_integer(3));
        map.delete(&path("a.b"));
        assert!(map.get(&path("a.b")).is_none());
        assert_eq!(map.leaf_paths(), vec![path("a.c")]);
    }
}
