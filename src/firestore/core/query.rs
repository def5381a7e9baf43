use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::filter::{inequality_fields, Filter};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::values::{canonical_id, compare_values};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{suffix}", self.field.canonical_string())
    }
}

/// Cursor position over the normalized order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                let key_value =
                    FirestoreValue::from_reference(document.key().path().canonical_string());
                compare_values(component, &key_value)
            } else {
                match document.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Less,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A client query: a collection, collection group, or single document with
/// filters, ordering, limit and cursors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> FirestoreResult<Self> {
        if path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid collection path ({path}); use Query::document for documents"
            )));
        }
        Ok(Self::at_path(path))
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Collection group query restricted to documents below `parent`.
    pub fn collection_group_at(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(parent);
        query.collection_group = Some(collection_id.into());
        query
    }

    fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Rebuilds a limit-to-first query from a target allocated by another
    /// client context.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            explicit_order_by: target.order_by.clone(),
            filters: target.filters.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    /// Same query without its limit, used to refill a limited view from cache.
    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    /// Collection query rooted at `path`, used to fan a collection group out per parent.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Explicit order, then implicit order on inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut normalized = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> =
            normalized.iter().map(|order| order.field.clone()).collect();
        let last_direction = normalized
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);
        for field in inequality_fields(&self.filters) {
            if !field.is_key_field() && seen.insert(field.clone()) {
                normalized.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            normalized.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        normalized
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{suffix}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, document: &MutableDocument) -> bool {
        let doc_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if self.path.is_document_path() {
            self.path == *doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents by the normalized order-by, ending in key order.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        compare_by_order(&self.normalized_order_by(), left, right)
    }
}

pub(crate) fn compare_by_order(
    order_by: &[OrderBy],
    left: &MutableDocument,
    right: &MutableDocument,
) -> Ordering {
    for order in order_by {
        let ordering = if order.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&order.field), right.field(&order.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        let ordering = match order.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.key().cmp(right.key())
}
