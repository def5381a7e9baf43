//! Cross-type ordering, equality and canonical rendering of values.

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

pub const TYPE_ORDER_NULL: u8 = 0;
pub const TYPE_ORDER_BOOLEAN: u8 = 1;
pub const TYPE_ORDER_NUMBER: u8 = 2;
pub const TYPE_ORDER_TIMESTAMP: u8 = 3;
pub const TYPE_ORDER_STRING: u8 = 4;
pub const TYPE_ORDER_BYTES: u8 = 5;
pub const TYPE_ORDER_REFERENCE: u8 = 6;
pub const TYPE_ORDER_ARRAY: u8 = 7;
pub const TYPE_ORDER_MAP: u8 = 8;

pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => TYPE_ORDER_NULL,
        ValueKind::Boolean(_) => TYPE_ORDER_BOOLEAN,
        ValueKind::Integer(_) | ValueKind::Double(_) => TYPE_ORDER_NUMBER,
        ValueKind::Timestamp(_) => TYPE_ORDER_TIMESTAMP,
        ValueKind::String(_) => TYPE_ORDER_STRING,
        ValueKind::Bytes(_) => TYPE_ORDER_BYTES,
        ValueKind::Reference(_) => TYPE_ORDER_REFERENCE,
        ValueKind::Array(_) => TYPE_ORDER_ARRAY,
        ValueKind::Map(_) => TYPE_ORDER_MAP,
    }
}

/// Total order over all values. Types order first, NaN sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (a, b) in l.values().iter().zip(r.values()) {
                let ordering = compare_values(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.len().cmp(&r.len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields()) {
        let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

/// Query equality: integers never equal doubles, NaN equals NaN, `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
        }
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.len() == r.len()
                && l.values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().zip(r.fields()).all(|((lk, lv), (rk, rv))| {
                    lk == rk && values_equal(lv, rv)
                })
        }
        _ => type_order(left) == type_order(right) && left == right,
    }
}

pub fn array_contains(array: &FirestoreValue, needle: &FirestoreValue) -> bool {
    array
        .as_array()
        .map(|values| values.values().iter().any(|value| values_equal(value, needle)))
        .unwrap_or(false)
}

/// Stable textual form used in target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => {
            if value.is_nan() {
                "NaN".to_string()
            } else {
                format!("{value:?}")
            }
        }
        ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(value) => value.to_base64(),
        ValueKind::Reference(value) => value.clone(),
        ValueKind::Array(array) => {
            let inner: Vec<String> = array.values().iter().map(canonical_id).collect();
            format!("[{}]", inner.join(","))
        }
        ValueKind::Map(map) => {
            let inner: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_across_types() {
        let values = [
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("rooms/a"),
            FirestoreValue::from_array(vec![]),
        ];
        for pair in values.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn integer_and_double_compare_but_are_not_equal() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&int, &double), Ordering::Equal);
        assert!(!values_equal(&int, &double));
        assert!(values_equal(
            &FirestoreValue::from_double(f64::NAN),
            &FirestoreValue::from_double(f64::NAN)
        ));
    }

    #[test]
    fn references_compare_by_segment() {
        let short = FirestoreValue::from_reference("a/b");
        let long = FirestoreValue::from_reference("a/b/c/d");
        let other = FirestoreValue::from_reference("a/ba");
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert_eq!(compare_values(&long, &other), Ordering::Less);
    }
}
