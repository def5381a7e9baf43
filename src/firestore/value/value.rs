use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::Timestamp;
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    /// Database-relative document path.
    Reference(String),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Firestore JSON proto representation. References stay database-relative.
    pub fn to_json(&self) -> JsonValue {
        match &self.kind {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(value) => json!({ "booleanValue": value }),
            ValueKind::Integer(value) => json!({ "integerValue": value.to_string() }),
            ValueKind::Double(value) => {
                if value.is_nan() {
                    json!({ "doubleValue": "NaN" })
                } else if value.is_infinite() {
                    let rendered = if *value > 0.0 { "Infinity" } else { "-Infinity" };
                    json!({ "doubleValue": rendered })
                } else {
                    json!({ "doubleValue": value })
                }
            }
            ValueKind::Timestamp(value) => json!({
                "timestampValue": { "seconds": value.seconds.to_string(), "nanos": value.nanos }
            }),
            ValueKind::String(value) => json!({ "stringValue": value }),
            ValueKind::Bytes(value) => json!({ "bytesValue": value.to_base64() }),
            ValueKind::Reference(value) => json!({ "referenceValue": value }),
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> = array.values().iter().map(Self::to_json).collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => {
                let mut fields = JsonMap::new();
                for (key, value) in map.fields() {
                    fields.insert(key.clone(), value.to_json());
                }
                json!({ "mapValue": { "fields": fields } })
            }
        }
    }

    pub fn from_json(value: &JsonValue) -> FirestoreResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Firestore value must be a JSON object"))?;
        let (kind, payload) = object
            .iter()
            .next()
            .ok_or_else(|| invalid_argument("Firestore value is empty"))?;
        match kind.as_str() {
            "nullValue" => Ok(Self::null()),
            "booleanValue" => payload
                .as_bool()
                .map(Self::from_bool)
                .ok_or_else(|| invalid_argument("booleanValue must be a bool")),
            "integerValue" => {
                let parsed = match payload {
                    JsonValue::String(raw) => raw.parse::<i64>().ok(),
                    JsonValue::Number(number) => number.as_i64(),
                    _ => None,
                };
                parsed
                    .map(Self::from_integer)
                    .ok_or_else(|| invalid_argument("integerValue must be an int64"))
            }
            "doubleValue" => {
                let parsed = match payload {
                    JsonValue::String(raw) => match raw.as_str() {
                        "NaN" => Some(f64::NAN),
                        "Infinity" => Some(f64::INFINITY),
                        "-Infinity" => Some(f64::NEG_INFINITY),
                        other => other.parse::<f64>().ok(),
                    },
                    JsonValue::Number(number) => number.as_f64(),
                    _ => None,
                };
                parsed
                    .map(Self::from_double)
                    .ok_or_else(|| invalid_argument("doubleValue must be a number"))
            }
            "timestampValue" => decode_timestamp(payload).map(Self::from_timestamp),
            "stringValue" => payload
                .as_str()
                .map(Self::from_string)
                .ok_or_else(|| invalid_argument("stringValue must be a string")),
            "bytesValue" => {
                let raw = payload
                    .as_str()
                    .ok_or_else(|| invalid_argument("bytesValue must be base64"))?;
                BytesValue::from_base64(raw)
                    .map(Self::from_bytes)
                    .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))
            }
            "referenceValue" => payload
                .as_str()
                .map(Self::from_reference)
                .ok_or_else(|| invalid_argument("referenceValue must be a string")),
            "arrayValue" => {
                let mut values = Vec::new();
                if let Some(items) = payload.get("values").and_then(JsonValue::as_array) {
                    for item in items {
                        values.push(Self::from_json(item)?);
                    }
                }
                Ok(Self::from_array(values))
            }
            "mapValue" => {
                let mut fields = BTreeMap::new();
                if let Some(entries) = payload.get("fields").and_then(JsonValue::as_object) {
                    for (key, item) in entries {
                        fields.insert(key.clone(), Self::from_json(item)?);
                    }
                }
                Ok(Self::from_map(fields))
            }
            other => Err(invalid_argument(format!("Unsupported value type: {other}"))),
        }
    }
}

/// Accepts both the `{seconds, nanos}` object and RFC 3339 strings.
fn decode_timestamp(payload: &JsonValue) -> FirestoreResult<Timestamp> {
    match payload {
        JsonValue::String(raw) => {
            let parsed = chrono::DateTime::parse_from_rfc3339(raw)
                .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
            Ok(Timestamp::new(
                parsed.timestamp(),
                parsed.timestamp_subsec_nanos() as i32,
            ))
        }
        JsonValue::Object(fields) => {
            let seconds = match fields.get("seconds") {
                Some(JsonValue::String(raw)) => raw.parse::<i64>().ok(),
                Some(JsonValue::Number(number)) => number.as_i64(),
                None => Some(0),
                _ => None,
            }
            .ok_or_else(|| invalid_argument("Invalid timestamp seconds"))?;
            let nanos = fields
                .get("nanos")
                .and_then(JsonValue::as_i64)
                .unwrap_or_default();
            Ok(Timestamp::new(seconds, nanos as i32))
        }
        _ => Err(invalid_argument("timestampValue must be a string or object")),
    }
}

impl Serialize for FirestoreValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FirestoreValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        FirestoreValue::from_json(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_survives_json() {
        let value = FirestoreValue::from_double(f64::NAN);
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: FirestoreValue = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_nan());
    }

    #[test]
    fn decodes_nested_map() {
        let raw = json!({
            "mapValue": { "fields": {
                "count": { "integerValue": "3" },
                "tags": { "arrayValue": { "values": [ { "stringValue": "a" } ] } }
            } }
        });
        let value = FirestoreValue::from_json(&raw).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.fields().get("count"), Some(&FirestoreValue::from_integer(3)));
        assert_eq!(map.fields().get("tags").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));
    }

    #[test]
    fn accepts_rfc3339_timestamps() {
        let raw = json!({ "timestampValue": "2024-01-01T00:00:01.5Z" });
        let value = FirestoreValue::from_json(&raw).unwrap();
        match value.kind() {
            ValueKind::Timestamp(ts) => assert_eq!(ts.nanos, 500_000_000),
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
