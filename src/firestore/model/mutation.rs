use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, Timestamp};
use crate::firestore::value::values::values_equal;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(Timestamp),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(time) => {
                document.is_found_document() && document.version() == *time
            }
        }
    }
}

/// Set of field paths a patch touches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` or one of its parents is in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<I: IntoIterator<Item = FieldPath>>(mut self, extra: I) -> Self {
        self.fields.extend(extra);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the masked fields; masked paths missing from `value` are deleted.
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    /// Asserts the precondition without changing data.
    Verify,
}

/// A single write to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: DocumentKey,
    pub kind: MutationKind,
    pub precondition: Precondition,
    #[serde(default)]
    pub field_transforms: Vec<FieldTransform>,
}

/// Outcome of one mutation as reported by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: Timestamp,
    pub transform_results: Vec<FirestoreValue>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch with an `exists` precondition, the shape produced by `update()`.
    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { value, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Fields this mutation changes, or `None` when it rewrites the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(
                mask.clone()
                    .union_with(self.field_transforms.iter().map(|t| t.field.clone())),
            ),
            _ => None,
        }
    }

    /// Applies the acknowledged mutation to the remote copy of the document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = document.data().clone();
                apply_patch(&mut data, value, mask);
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the mutation to the latency-compensated view and returns the
    /// accumulated mask (`None` means the whole document changed).
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                apply_patch(&mut data, value, mask);
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields().iter().cloned())
                        .union_with(self.field_transforms.iter().map(|t| t.field.clone()))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Base values that non-idempotent transforms need to be replayed later.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        for transform in &self.field_transforms {
            let existing = document.field(&transform.field);
            if let TransformOperation::NumericIncrement(_) = transform.operation {
                let coerced = match existing {
                    Some(value) if value.is_number() => value.clone(),
                    _ => FirestoreValue::from_integer(0),
                };
                base.set(&transform.field, coerced);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        server_results: &[FirestoreValue],
    ) -> Vec<FirestoreValue> {
        if server_results.len() != self.field_transforms.len() {
            log::warn!(
                "server returned {} transform results for {} transforms on {}",
                server_results.len(),
                self.field_transforms.len(),
                self.key
            );
            return self.local_transform_results(document, Timestamp::now());
        }
        server_results.to_vec()
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<FirestoreValue> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let existing = document.field(&transform.field);
                apply_transform_locally(&transform.operation, existing, local_write_time)
            })
            .collect()
    }
}

/// The mutation that turns the cached remote document into `document`'s current
/// local state, or `None` when no local change is pending.
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }
    let key = document.key().clone();
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(key));
        }
        return Some(Mutation::set(key, document.data().clone()));
    };

    let data = document.data();
    let mut patch_value = MapValue::empty();
    let mut patch_fields = BTreeSet::new();
    for field in mask.fields() {
        if patch_fields.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.get(&path);
        // A deleted nested field is written through its parent map.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.get(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        patch_fields.insert(path);
    }
    Some(Mutation {
        key,
        kind: MutationKind::Patch {
            value: patch_value,
            mask: FieldMask {
                fields: patch_fields,
            },
        },
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

fn apply_patch(data: &mut MapValue, value: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match value.get(path) {
            Some(new_value) => data.set(path, new_value.clone()),
            None => data.delete(path),
        }
    }
}

fn apply_transform_results(
    data: &mut MapValue,
    transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) {
    for (transform, result) in transforms.iter().zip(results) {
        data.set(&transform.field, result);
    }
}

fn apply_transform_locally(
    operation: &TransformOperation,
    existing: Option<&FirestoreValue>,
    local_write_time: Timestamp,
) -> FirestoreValue {
    match operation {
        TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
        TransformOperation::ArrayUnion(elements) => {
            let mut values = existing_array(existing);
            for element in elements {
                if !values.iter().any(|candidate| values_equal(candidate, element)) {
                    values.push(element.clone());
                }
            }
            FirestoreValue::from_array(values)
        }
        TransformOperation::ArrayRemove(elements) => {
            let values = existing_array(existing)
                .into_iter()
                .filter(|candidate| !elements.iter().any(|needle| values_equal(needle, candidate)))
                .collect();
            FirestoreValue::from_array(values)
        }
        TransformOperation::NumericIncrement(operand) => numeric_increment(existing, operand),
    }
}

fn existing_array(existing: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = existing.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}
