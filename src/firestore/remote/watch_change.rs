use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, Timestamp};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::rpc_error::{decode_status, encode_status};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message from the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "all targets".
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    pub read_time: Timestamp,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: Timestamp::MIN,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: Timestamp) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

impl TargetChangeState {
    fn as_str(&self) -> &'static str {
        match self {
            TargetChangeState::NoChange => "NO_CHANGE",
            TargetChangeState::Add => "ADD",
            TargetChangeState::Remove => "REMOVE",
            TargetChangeState::Current => "CURRENT",
            TargetChangeState::Reset => "RESET",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "ADD" => TargetChangeState::Add,
            "REMOVE" => TargetChangeState::Remove,
            "CURRENT" => TargetChangeState::Current,
            "RESET" => TargetChangeState::Reset,
            _ => TargetChangeState::NoChange,
        }
    }
}

/// A document entered, changed in, or left some targets. `document` is
/// `None` for a remove, a deleted document for a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub document: Option<MutableDocument>,
}

/// Count the backend holds for a target, optionally with a bloom filter over
/// the unchanged document names.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    pub unchanged_names: Option<UnchangedNames>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnchangedNames {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

impl UnchangedNames {
    pub fn from_filter(filter: &BloomFilter) -> Self {
        Self {
            bitmap: filter.bitmap().to_vec(),
            padding: filter.padding() as i32,
            hash_count: filter.hash_count() as i32,
        }
    }

    pub fn to_bloom_filter(&self) -> FirestoreResult<BloomFilter> {
        BloomFilter::new(self.bitmap.clone(), self.padding, self.hash_count)
    }
}

/// Decodes a listen response. Unknown messages decode to `None`.
pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

/// Inverse of [`decode_watch_change`], used by backends and tests.
pub fn encode_watch_change(serializer: &JsonProtoSerializer, change: &WatchChange) -> JsonValue {
    match change {
        WatchChange::TargetChange(change) => {
            let mut encoded = serde_json::Map::new();
            encoded.insert("targetChangeType".into(), json!(change.state.as_str()));
            encoded.insert("targetIds".into(), json!(change.target_ids));
            if !change.resume_token.is_empty() {
                encoded.insert("resumeToken".into(), json!(BASE64_STANDARD.encode(&change.resume_token)));
            }
            if !change.read_time.is_min() {
                encoded.insert("readTime".into(), json!(serializer.encode_timestamp(change.read_time)));
            }
            if let Some(cause) = &change.cause {
                encoded.insert("cause".into(), encode_status(cause));
            }
            json!({ "targetChange": encoded })
        }
        WatchChange::Document(change) => match &change.document {
            Some(document) if document.is_found_document() => json!({
                "documentChange": {
                    "document": serializer.encode_document(document),
                    "targetIds": change.updated_target_ids,
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            Some(document) => json!({
                "documentDelete": {
                    "document": serializer.document_name(&change.key),
                    "readTime": serializer.encode_timestamp(document.version()),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            None => json!({
                "documentRemove": {
                    "document": serializer.document_name(&change.key),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
        },
        WatchChange::ExistenceFilter(filter) => {
            let mut encoded = serde_json::Map::new();
            encoded.insert("targetId".into(), json!(filter.target_id));
            encoded.insert("count".into(), json!(filter.count));
            if let Some(names) = &filter.unchanged_names {
                encoded.insert(
                    "unchangedNames".into(),
                    json!({
                        "bits": {
                            "bitmap": BASE64_STANDARD.encode(&names.bitmap),
                            "padding": names.padding,
                        },
                        "hashCount": names.hash_count,
                    }),
                );
            }
            json!({ "filter": encoded })
        }
    }
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .map(|token| BASE64_STANDARD.decode(token))
        .transpose()
        .map_err(|err| invalid_argument(format!("Invalid resume token: {err}")))?
        .unwrap_or_default();
    let read_time = value
        .get("readTime")
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?
        .unwrap_or(Timestamp::MIN);
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(TargetChangeState::from_str)
        .unwrap_or(TargetChangeState::NoChange);
    let cause = value.get("cause").map(decode_status);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let encoded = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange is missing document"))?;
    let document = serializer.decode_found_document(encoded)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key_field(serializer, value, "documentDelete")?;
    let read_time = value
        .get("readTime")
        .map(|timestamp| serializer.decode_timestamp(timestamp))
        .transpose()?
        .unwrap_or(Timestamp::MIN);
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        document: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key_field(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        document: None,
    }))
}

fn document_key_field(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} is missing document")))?;
    serializer.decode_document_key(name)
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter is missing targetId"))? as i32;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(|names| -> FirestoreResult<UnchangedNames> {
            let bits = names.get("bits");
            let bitmap = bits
                .and_then(|bits| bits.get("bitmap"))
                .and_then(JsonValue::as_str)
                .map(|bitmap| BASE64_STANDARD.decode(bitmap))
                .transpose()
                .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))?
                .unwrap_or_default();
            let padding = bits
                .and_then(|bits| bits.get("padding"))
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32;
            let hash_count = names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
            Ok(UnchangedNames {
                bitmap,
                padding,
                hash_count,
            })
        })
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as i32))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::value::MapValue;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.read_time.is_min());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn removal_cause_survives_encoding() {
        let serializer = serializer();
        let change = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Remove, vec![4]).with_cause(permission_denied("denied")),
        );
        let decoded = decode_watch_change(&serializer, &encode_watch_change(&serializer, &change))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn document_delete_becomes_no_document_at_read_time() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let change = WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: vec![2],
            key: key.clone(),
            document: Some(MutableDocument::new_no_document(key, Timestamp::new(5, 0))),
        });
        let encoded = encode_watch_change(&serializer, &change);
        assert!(encoded.get("documentDelete").is_some());
        assert_eq!(decode_watch_change(&serializer, &encoded).unwrap().unwrap(), change);
    }

    #[test]
    fn found_document_carries_fields_and_targets() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let document = MutableDocument::new_found_document(key.clone(), Timestamp::new(3, 0), MapValue::empty());
        let change = WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![2],
            removed_target_ids: Vec::new(),
            key,
            document: Some(document),
        });
        let encoded = encode_watch_change(&serializer, &change);
        assert_eq!(decode_watch_change(&serializer, &encoded).unwrap().unwrap(), change);
    }

    #[test]
    fn existence_filter_decodes_bloom_bits() {
        let encoded = json!({
            "filter": {
                "targetId": 2,
                "count": 1,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0b0000_0101u8]), "padding": 3 },
                    "hashCount": 2
                }
            }
        });
        match decode_watch_change(&serializer(), &encoded).unwrap().unwrap() {
            WatchChange::ExistenceFilter(filter) => {
                assert_eq!(filter.count, 1);
                let names = filter.unchanged_names.unwrap();
                assert_eq!(names.padding, 3);
                assert_eq!(names.to_bloom_filter().unwrap().bit_count(), 5);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn unknown_messages_are_ignored() {
        assert!(decode_watch_change(&serializer(), &json!({ "other": {} })).unwrap().is_none());
    }
}
