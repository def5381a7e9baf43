//! Order-preserving byte encoding of values for index entries.
//!
//! Every encoding is self-delimiting, so concatenated segment encodings compare
//! segment by segment and a descending segment is the byte-wise complement of
//! its ascending form.

use crate::firestore::value::{FirestoreValue, ValueKind};

const TAG_NULL: u8 = 5;
const TAG_BOOLEAN: u8 = 10;
const TAG_NAN: u8 = 13;
const TAG_NUMBER: u8 = 15;
const TAG_TIMESTAMP: u8 = 20;
const TAG_STRING: u8 = 25;
const TAG_BYTES: u8 = 30;
const TAG_REFERENCE: u8 = 37;
const TAG_REFERENCE_SEGMENT: u8 = 38;
const TAG_ARRAY: u8 = 50;
const TAG_MAP: u8 = 55;

const END: u8 = 1;
const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const ESCAPED_FF: u8 = 0x00;
const SEPARATOR: u8 = 0x01;

/// Sorts after every encoded segment, in either direction.
pub const INFINITY: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexDirection {
    Ascending,
    Descending,
}

pub fn encode_index_value(value: &FirestoreValue, direction: IndexDirection) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    if direction == IndexDirection::Descending {
        invert(&mut out);
    }
    out
}

/// Smallest encoding among values of the same type as `value`.
pub fn lower_type_bound(value: &FirestoreValue) -> Vec<u8> {
    vec![type_tag(value)]
}

/// Encoding that sorts after every value of the same type as `value`.
pub fn upper_type_bound(value: &FirestoreValue) -> Vec<u8> {
    let tag = type_tag(value);
    match tag {
        // NaN and numbers share a query type.
        TAG_NAN => vec![TAG_NUMBER + 1],
        _ => vec![tag + 1],
    }
}

pub fn invert(bytes: &mut [u8]) {
    for byte in bytes.iter_mut() {
        *byte = !*byte;
    }
}

fn type_tag(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => TAG_NULL,
        ValueKind::Boolean(_) => TAG_BOOLEAN,
        ValueKind::Double(v) if v.is_nan() => TAG_NAN,
        ValueKind::Integer(_) | ValueKind::Double(_) => TAG_NUMBER,
        ValueKind::Timestamp(_) => TAG_TIMESTAMP,
        ValueKind::String(_) => TAG_STRING,
        ValueKind::Bytes(_) => TAG_BYTES,
        ValueKind::Reference(_) => TAG_REFERENCE,
        ValueKind::Array(_) => TAG_ARRAY,
        ValueKind::Map(_) => TAG_MAP,
    }
}

fn write_value(value: &FirestoreValue, out: &mut Vec<u8>) {
    out.push(type_tag(value));
    match value.kind() {
        ValueKind::Null => {}
        ValueKind::Boolean(flag) => out.push(u8::from(*flag)),
        ValueKind::Double(v) if v.is_nan() => {}
        ValueKind::Integer(v) => write_double(*v as f64, out),
        ValueKind::Double(v) => write_double(*v, out),
        ValueKind::Timestamp(ts) => {
            out.extend_from_slice(&((ts.seconds as u64) ^ (1 << 63)).to_be_bytes());
            out.extend_from_slice(&(ts.nanos as u32).to_be_bytes());
        }
        ValueKind::String(s) => write_escaped(s.as_bytes(), out),
        ValueKind::Bytes(b) => write_escaped(b.as_slice(), out),
        ValueKind::Reference(path) => {
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                out.push(TAG_REFERENCE_SEGMENT);
                write_escaped(segment.as_bytes(), out);
            }
            out.push(END);
        }
        ValueKind::Array(array) => {
            for element in array.values() {
                write_value(element, out);
            }
            out.push(END);
        }
        ValueKind::Map(map) => {
            for (key, element) in map.fields() {
                out.push(TAG_STRING);
                write_escaped(key.as_bytes(), out);
                write_value(element, out);
            }
            out.push(END);
        }
    }
}

fn write_double(value: f64, out: &mut Vec<u8>) {
    // Collapse -0.0 so both zeros land on the same entry.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, ESCAPED_NUL]),
            0xFF => out.extend_from_slice(&[0xFF, ESCAPED_FF]),
            other => out.push(other),
        }
    }
    out.extend_from_slice(&[ESCAPE, SEPARATOR]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn asc(value: FirestoreValue) -> Vec<u8> {
        encode_index_value(&value, IndexDirection::Ascending)
    }

    fn desc(value: FirestoreValue) -> Vec<u8> {
        encode_index_value(&value, IndexDirection::Descending)
    }

    #[test]
    fn numbers_keep_their_order() {
        let ordered = [
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NEG_INFINITY),
            FirestoreValue::from_integer(-10),
            FirestoreValue::from_double(-0.5),
            FirestoreValue::from_integer(0),
            FirestoreValue::from_double(2.5),
            FirestoreValue::from_integer(3),
        ];
        for pair in ordered.windows(2) {
            assert!(asc(pair[0].clone()) < asc(pair[1].clone()), "{pair:?}");
            assert!(desc(pair[0].clone()) > desc(pair[1].clone()), "{pair:?}");
        }
    }

    #[test]
    fn string_prefixes_sort_first_in_both_directions() {
        let short = FirestoreValue::from_string("ab");
        let long = FirestoreValue::from_string("abc");
        assert!(asc(short.clone()) < asc(long.clone()));
        assert!(desc(short) > desc(long));
    }

    #[test]
    fn embedded_nul_bytes_are_escaped() {
        let with_nul = FirestoreValue::from_string("a\u{0}");
        let plain = FirestoreValue::from_string("a");
        let after = FirestoreValue::from_string("a\u{1}");
        assert!(asc(plain.clone()) < asc(with_nul.clone()));
        assert!(asc(with_nul) < asc(after));
    }

    #[test]
    fn type_bounds_enclose_values() {
        let value = FirestoreValue::from_timestamp(Timestamp::new(5, 0));
        let encoded = asc(value.clone());
        assert!(lower_type_bound(&value) <= encoded);
        assert!(encoded < upper_type_bound(&value));
        assert!(asc(FirestoreValue::from_string("")) > upper_type_bound(&value));
    }

    #[test]
    fn arrays_compare_elementwise() {
        let a = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let b = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        assert!(asc(a.clone()) < asc(b.clone()));
        assert!(desc(a) > desc(b));
    }
}
