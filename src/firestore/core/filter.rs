use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldPath, MutableDocument};
use crate::firestore::value::values::{array_contains, canonical_id, compare_values, type_order};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    pub fn is_array_operator(&self) -> bool {
        matches!(self, Operator::ArrayContains | Operator::ArrayContainsAny)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let key_value;
        let other = if self.field.is_key_field() {
            key_value = FirestoreValue::from_reference(document.key().path().canonical_string());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };
        let Some(other) = other else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => array_contains(other, &self.value),
            Operator::ArrayContainsAny => other
                .as_array()
                .map(|values| {
                    values
                        .values()
                        .iter()
                        .any(|candidate| array_contains(&self.value, candidate))
                })
                .unwrap_or(false),
            Operator::In => array_contains(&self.value, other),
            Operator::NotIn => {
                !array_contains(&self.value, &FirestoreValue::null())
                    && !other.is_null()
                    && !array_contains(&self.value, other)
            }
            Operator::NotEqual => {
                !other.is_null() && compare_values(other, &self.value) != Ordering::Equal
            }
            _ => {
                type_order(other) == type_order(&self.value)
                    && self.matches_comparison(compare_values(other, &self.value))
            }
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite {
        op: CompositeOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|filter| filter.matches(document)),
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.iter().any(|filter| filter.matches(document)),
        }
    }

    pub fn flattened_filters(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => {
                filters.iter().flat_map(Filter::flattened_filters).collect()
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite { op, filters } => {
                let inner: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                let label = match op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{label}({})", inner.join(","))
            }
        }
    }
}

pub fn inequality_fields(filters: &[Filter]) -> BTreeSet<FieldPath> {
    filters
        .iter()
        .flat_map(Filter::flattened_filters)
        .filter(|filter| filter.op.is_inequality())
        .map(|filter| filter.field.clone())
        .collect()
}

/// Rewrites a filter tree into disjunctive normal form: an OR of AND-only terms.
pub fn compute_dnf(filter: &Filter) -> Vec<Vec<FieldFilter>> {
    match filter {
        Filter::Field(filter) => vec![vec![filter.clone()]],
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        } => filters.iter().flat_map(compute_dnf).collect(),
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        } => {
            let mut terms: Vec<Vec<FieldFilter>> = vec![Vec::new()];
            for child in filters {
                let child_terms = compute_dnf(child);
                let mut next = Vec::with_capacity(terms.len() * child_terms.len());
                for term in &terms {
                    for child_term in &child_terms {
                        let mut merged = term.clone();
                        merged.extend(child_term.iter().cloned());
                        next.push(merged);
                    }
                }
                terms = next;
            }
            terms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, Timestamp};
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (path, value) in entries {
            data.set(&field(path), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string("rooms/a").unwrap(),
            Timestamp::new(1, 0),
            data,
        )
    }

    #[test]
    fn comparison_is_type_restricted() {
        let filter = FieldFilter::new(field("n"), Operator::GreaterThan, FirestoreValue::from_integer(1));
        assert!(filter.matches(&doc(&[("n", FirestoreValue::from_double(1.5))])));
        assert!(!filter.matches(&doc(&[("n", FirestoreValue::from_string("z"))])));
        assert!(!filter.matches(&doc(&[])));
    }

    #[test]
    fn not_equal_skips_missing_and_null() {
        let filter = FieldFilter::new(field("n"), Operator::NotEqual, FirestoreValue::from_integer(1));
        assert!(!filter.matches(&doc(&[])));
        assert!(!filter.matches(&doc(&[("n", FirestoreValue::null())])));
        assert!(filter.matches(&doc(&[("n", FirestoreValue::from_integer(2))])));
    }

    #[test]
    fn array_contains_any_matches_overlap() {
        let filter = FieldFilter::new(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("b")]),
        );
        let tags = FirestoreValue::from_array(vec![
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
        ]);
        assert!(filter.matches(&doc(&[("tags", tags)])));
    }

    #[test]
    fn dnf_distributes_and_over_or() {
        let a = Filter::field(field("a"), Operator::Equal, FirestoreValue::from_integer(1));
        let b = Filter::field(field("b"), Operator::Equal, FirestoreValue::from_integer(1));
        let c = Filter::field(field("c"), Operator::Equal, FirestoreValue::from_integer(1));
        let tree = Filter::and(vec![a, Filter::or(vec![b, c])]);
        let dnf = compute_dnf(&tree);
        assert_eq!(dnf.len(), 2);
        assert!(dnf.iter().all(|term| term.len() == 2));
    }
}
