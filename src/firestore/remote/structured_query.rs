use serde_json::{json, Value as JsonValue};

use crate::firestore::core::filter::{CompositeOperator, FieldFilter, Filter, Operator};
use crate::firestore::core::query::{Bound, Direction, OrderBy, Query};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::FieldPath;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// `{parent, structuredQuery}` for a query target.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let (parent, collection_id, all_descendants) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone(), true),
        None => (
            target.path.without_last(),
            target.path.last_segment().unwrap_or_default().to_string(),
            false,
        ),
    };

    let mut structured = serde_json::Map::new();
    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
    );

    if !target.filters.is_empty() {
        structured.insert("where".to_string(), encode_filters(serializer, &target.filters));
    }

    if !target.order_by.is_empty() {
        let orders: Vec<_> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": order.direction.as_str(),
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit as i64));
    }

    if let Some(start) = &target.start_at {
        structured.insert("startAt".to_string(), encode_cursor(serializer, start, true));
    }

    if let Some(end) = &target.end_at {
        structured.insert("endAt".to_string(), encode_cursor(serializer, end, false));
    }

    json!({
        "parent": serializer.resource_name(&parent),
        "structuredQuery": JsonValue::Object(structured),
    })
}

/// Rebuilds a query whose target equals the encoded one.
pub(crate) fn decode_query_target(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Query> {
    let parent = value
        .get("parent")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Query target is missing its parent"))?;
    let parent = serializer.decode_resource_path(parent)?;
    let structured = value
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("Query target is missing structuredQuery"))?;

    let from = structured
        .get("from")
        .and_then(JsonValue::as_array)
        .and_then(|entries| entries.first())
        .ok_or_else(|| invalid_argument("structuredQuery needs exactly one 'from' entry"))?;
    let collection_id = from
        .get("collectionId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("'from' entry is missing collectionId"))?;
    let all_descendants = from
        .get("allDescendants")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let mut query = if all_descendants {
        Query::collection_group_at(parent, collection_id)
    } else {
        Query::collection(parent.child([collection_id]))?
    };

    if let Some(filter) = structured.get("where") {
        match decode_filter(serializer, filter)? {
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => {
                for filter in filters {
                    query = query.with_filter(filter);
                }
            }
            other => query = query.with_filter(other),
        }
    }

    if let Some(orders) = structured.get("orderBy").and_then(JsonValue::as_array) {
        for order in orders {
            let field = decode_field_reference(order.get("field"))?;
            let direction = match order.get("direction").and_then(JsonValue::as_str) {
                Some("DESCENDING") => Direction::Descending,
                _ => Direction::Ascending,
            };
            query = query.with_order_by(OrderBy::new(field, direction));
        }
    }

    if let Some(limit) = structured.get("limit") {
        let limit = limit
            .as_u64()
            .or_else(|| limit.get("value").and_then(JsonValue::as_u64))
            .ok_or_else(|| invalid_argument("Invalid limit"))?;
        query = query.with_limit_to_first(limit as u32);
    }

    if let Some(start) = structured.get("startAt") {
        let (values, before) = decode_cursor(serializer, start)?;
        query = query.with_start_at(Bound::new(values, before));
    }

    if let Some(end) = structured.get("endAt") {
        let (values, before) = decode_cursor(serializer, end)?;
        query = query.with_end_at(Bound::new(values, !before));
    }

    Ok(query)
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[Filter]) -> JsonValue {
    if filters.len() == 1 {
        return encode_filter(serializer, &filters[0]);
    }
    let nested: Vec<_> = filters.iter().map(|filter| encode_filter(serializer, filter)).collect();
    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": nested
        }
    })
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(filter) => encode_field_filter(serializer, filter),
        Filter::Composite { op, filters } => {
            let nested: Vec<_> = filters.iter().map(|filter| encode_filter(serializer, filter)).collect();
            let op = match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            };
            json!({
                "compositeFilter": {
                    "op": op,
                    "filters": nested
                }
            })
        }
    }
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field.canonical_string() },
            "op": filter.op.as_str(),
            "value": serializer.encode_value(&filter.value)
        }
    })
}

fn decode_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Filter> {
    if let Some(field_filter) = value.get("fieldFilter") {
        let field = decode_field_reference(field_filter.get("field"))?;
        let op = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("fieldFilter is missing op"))
            .and_then(operator_from_str)?;
        let value = field_filter
            .get("value")
            .ok_or_else(|| invalid_argument("fieldFilter is missing value"))?;
        return Ok(Filter::field(field, op, serializer.decode_value(value)?));
    }
    if let Some(composite) = value.get("compositeFilter") {
        let mut filters = Vec::new();
        if let Some(nested) = composite.get("filters").and_then(JsonValue::as_array) {
            for filter in nested {
                filters.push(decode_filter(serializer, filter)?);
            }
        }
        return match composite.get("op").and_then(JsonValue::as_str) {
            Some("OR") => Ok(Filter::or(filters)),
            _ => Ok(Filter::and(filters)),
        };
    }
    Err(invalid_argument(format!("Unsupported filter: {value}")))
}

fn operator_from_str(value: &str) -> FirestoreResult<Operator> {
    let op = match value {
        "LESS_THAN" => Operator::LessThan,
        "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
        "EQUAL" => Operator::Equal,
        "NOT_EQUAL" => Operator::NotEqual,
        "GREATER_THAN" => Operator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
        "ARRAY_CONTAINS" => Operator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
        "IN" => Operator::In,
        "NOT_IN" => Operator::NotIn,
        other => return Err(invalid_argument(format!("Unknown filter operator: {other}"))),
    };
    Ok(op)
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Field reference is missing fieldPath"))?;
    FieldPath::from_dot_separated(path)
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .position
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}

fn decode_cursor(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<(Vec<crate::firestore::value::FirestoreValue>, bool)> {
    let mut values = Vec::new();
    if let Some(encoded) = value.get("values").and_then(JsonValue::as_array) {
        for item in encoded {
            values.push(serializer.decode_value(item)?);
        }
    }
    let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
    Ok((values, before))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::value::FirestoreValue;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn nested_collection_splits_parent_and_collection_id() {
        let query = Query::collection(ResourcePath::from_string("rooms/a/messages").unwrap()).unwrap();
        let encoded = encode_query_target(&serializer(), &query.to_target());
        assert_eq!(encoded["parent"], json!("projects/p/databases/(default)/documents/rooms/a"));
        assert_eq!(encoded["structuredQuery"]["from"][0]["collectionId"], json!("messages"));
        assert_eq!(encoded["structuredQuery"]["from"][0]["allDescendants"], json!(false));
        assert_eq!(
            encoded["structuredQuery"]["orderBy"][0]["field"]["fieldPath"],
            json!("__name__")
        );
    }

    #[test]
    fn or_filters_and_cursors_decode_to_the_same_target() {
        let serializer = serializer();
        let query = Query::collection_group("messages")
            .with_filter(Filter::or(vec![
                Filter::field(field("a"), Operator::Equal, FirestoreValue::from_integer(1)),
                Filter::field(field("b"), Operator::In, FirestoreValue::from_array(vec![FirestoreValue::from_string("x")])),
            ]))
            .with_filter(Filter::field(field("c"), Operator::LessThan, FirestoreValue::from_integer(9)))
            .with_order_by(OrderBy::new(field("c"), Direction::Ascending))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(2)], false))
            .with_end_at(Bound::new(vec![FirestoreValue::from_integer(8)], true))
            .with_limit_to_last(4);
        let target = query.to_target();

        let encoded = encode_query_target(&serializer, &target);
        assert_eq!(encoded["structuredQuery"]["where"]["compositeFilter"]["op"], json!("AND"));
        assert_eq!(
            encoded["structuredQuery"]["where"]["compositeFilter"]["filters"][0]["compositeFilter"]["op"],
            json!("OR")
        );

        let decoded = decode_query_target(&serializer, &encoded).unwrap();
        assert_eq!(decoded.to_target(), target);
    }
}
