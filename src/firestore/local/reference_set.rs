use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Two-way index of (document key, id) references, used to pin documents
/// that a live view or a pending write still needs.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'k>(&mut self, keys: impl IntoIterator<Item = &'k DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'k>(&mut self, keys: impl IntoIterator<Item = &'k DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..=(key.clone(), i32::MAX))
            .next()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn references_are_tracked_per_id() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("rooms/a"), 1);
        set.add_reference(key("rooms/b"), 1);
        set.add_reference(key("rooms/a"), 2);

        assert_eq!(set.remove_references_for_id(1).len(), 2);
        assert!(set.contains_key(&key("rooms/a")));
        assert!(!set.contains_key(&key("rooms/b")));

        set.remove_reference(&key("rooms/a"), 2);
        assert!(set.is_empty());
    }
}
