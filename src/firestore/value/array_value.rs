use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }
}
