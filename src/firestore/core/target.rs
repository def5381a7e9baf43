use serde::{Deserialize, Serialize};

use crate::firestore::core::filter::{FieldFilter, Filter};
use crate::firestore::core::query::{Bound, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

/// What the backend is asked to watch: a normalized query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path()
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn document_key(&self) -> Option<DocumentKey> {
        if self.is_document_target() {
            DocumentKey::from_path(self.path.clone()).ok()
        } else {
            None
        }
    }

    /// All field filters in the target, with composite filters flattened.
    pub fn field_filters(&self) -> Vec<&FieldFilter> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_filters)
            .collect()
    }

    pub fn has_composite_or(&self) -> bool {
        self.filters.iter().any(|filter| {
            matches!(
                filter,
                Filter::Composite {
                    op: crate::firestore::core::filter::CompositeOperator::Or,
                    ..
                }
            )
        })
    }

    /// Stable identity used to share targets between equivalent queries.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}
