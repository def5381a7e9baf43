use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, MutableDocument, Mutation, MutationKind,
    MutationResult, Precondition, ResourcePath, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::{decode_query_target, encode_query_target};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Translates between the model and the JSON form of the listen/write
/// protocol.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

/// A client request on the listen stream, as seen by the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget {
        target_id: i32,
        query: Query,
        resume_token: Vec<u8>,
        read_time: Option<Timestamp>,
        expected_count: Option<i32>,
    },
    RemoveTarget(i32),
}

/// A client request on the write stream, as seen by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub stream_token: Option<Vec<u8>>,
    pub writes: Vec<Mutation>,
}

/// A backend reply on the write stream. The handshake reply carries no
/// results and a MIN commit version.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Timestamp,
    pub write_results: Vec<MutationResult>,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.resource_name()
    }

    /// `projects/{p}/databases/{d}/documents`
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Inverse of [`JsonProtoSerializer::resource_name`]. Rejects names from
    /// another database.
    pub fn decode_resource_path(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        let relative = name.strip_prefix(&root).ok_or_else(|| {
            invalid_argument(format!("Resource name {name} is not under {root}"))
        })?;
        match relative.strip_prefix('/') {
            Some(path) => ResourcePath::from_string(path),
            None if relative.is_empty() => Ok(ResourcePath::root()),
            None => Err(invalid_argument(format!("Invalid resource name: {name}"))),
        }
    }

    pub fn decode_document_key(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.decode_resource_path(name)?)
    }

    pub fn encode_timestamp(&self, timestamp: Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        decode_timestamp_string(value)
    }

    /// Accepts RFC 3339 strings and `{seconds, nanos}` objects.
    pub fn decode_timestamp(&self, value: &JsonValue) -> FirestoreResult<Timestamp> {
        match value {
            JsonValue::String(raw) => decode_timestamp_string(raw),
            JsonValue::Object(_) => {
                let wrapped = json!({ "timestampValue": value });
                match FirestoreValue::from_json(&wrapped)?.kind() {
                    crate::firestore::value::ValueKind::Timestamp(timestamp) => Ok(*timestamp),
                    _ => Err(invalid_argument("Invalid timestamp object")),
                }
            }
            _ => Err(invalid_argument("Timestamp must be a string or object")),
        }
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        value.to_json()
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        FirestoreValue::from_json(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (key, value) in map.fields() {
            fields.insert(key.clone(), value.to_json());
        }
        JsonValue::Object(fields)
    }

    pub fn decode_fields(&self, value: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        let Some(value) = value else {
            return Ok(MapValue::empty());
        };
        let entries = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut fields = BTreeMap::new();
        for (key, item) in entries {
            fields.insert(key.clone(), FirestoreValue::from_json(item)?);
        }
        Ok(MapValue::new(fields))
    }

    /// `{name, fields, updateTime, createTime}` for a found document.
    pub fn encode_document(&self, document: &MutableDocument) -> JsonValue {
        let mut encoded = serde_json::Map::new();
        encoded.insert("name".into(), json!(self.document_name(document.key())));
        encoded.insert("fields".into(), self.encode_fields(document.data()));
        encoded.insert("updateTime".into(), json!(encode_timestamp(document.version())));
        if !document.create_time().is_min() {
            encoded.insert("createTime".into(), json!(encode_timestamp(document.create_time())));
        }
        JsonValue::Object(encoded)
    }

    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.decode_document_key(name)?;
        let version = value
            .get("updateTime")
            .map(|time| self.decode_timestamp(time))
            .transpose()?
            .ok_or_else(|| invalid_argument("Got a document without an update time"))?;
        let data = self.decode_fields(value.get("fields"))?;
        let mut document = MutableDocument::new_found_document(key, version, data);
        if let Some(create_time) = value.get("createTime") {
            document.set_create_time(self.decode_timestamp(create_time)?);
        }
        Ok(document)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match &mutation.kind {
            MutationKind::Set { value } => {
                write.insert("update".into(), self.encode_update_document(&mutation.key, value));
            }
            MutationKind::Patch { value, mask } => {
                write.insert("update".into(), self.encode_update_document(&mutation.key, value));
                let paths: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(self.document_name(&mutation.key)));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(self.document_name(&mutation.key)));
            }
        }
        if !mutation.field_transforms.is_empty() {
            let transforms: Vec<JsonValue> = mutation
                .field_transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        match &mutation.precondition {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(time) => {
                write.insert("currentDocument".into(), json!({ "updateTime": encode_timestamp(*time) }));
            }
        }
        JsonValue::Object(write)
    }

    fn encode_update_document(&self, key: &DocumentKey, value: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": self.encode_fields(value),
        })
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        let encode_all = |values: &[FirestoreValue]| -> Vec<JsonValue> { values.iter().map(FirestoreValue::to_json).collect() };
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME",
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": encode_all(elements) },
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": encode_all(elements) },
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": operand.to_json(),
            }),
        }
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            None => Precondition::None,
            Some(current) => {
                if let Some(exists) = current.get("exists").and_then(JsonValue::as_bool) {
                    Precondition::Exists(exists)
                } else if let Some(time) = current.get("updateTime") {
                    Precondition::UpdateTime(self.decode_timestamp(time)?)
                } else {
                    Precondition::None
                }
            }
        };

        let mut mutation = if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Write update is missing a name"))?;
            let key = self.decode_document_key(name)?;
            let data = self.decode_fields(update.get("fields"))?;
            match value.get("updateMask") {
                Some(mask) => {
                    let paths = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(|paths| {
                            paths
                                .iter()
                                .filter_map(JsonValue::as_str)
                                .map(FieldPath::from_dot_separated)
                                .collect::<FirestoreResult<Vec<_>>>()
                        })
                        .transpose()?
                        .unwrap_or_default();
                    Mutation::patch(key, data, FieldMask::new(paths))
                }
                None => Mutation::set(key, data),
            }
        } else if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            Mutation::delete(self.decode_document_key(name)?)
        } else if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            Mutation::verify(self.decode_document_key(name)?, Precondition::None)
        } else {
            return Err(invalid_argument(format!("Unknown write: {value}")));
        };

        let mut transforms = Vec::new();
        if let Some(encoded) = value.get("updateTransforms").and_then(JsonValue::as_array) {
            for transform in encoded {
                transforms.push(self.decode_field_transform(transform)?);
            }
        }
        mutation = mutation.with_precondition(precondition).with_transforms(transforms);
        Ok(mutation)
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform is missing fieldPath"))
            .and_then(FieldPath::from_dot_separated)?;
        let decode_all = |values: &JsonValue| -> FirestoreResult<Vec<FirestoreValue>> {
            values
                .get("values")
                .and_then(JsonValue::as_array)
                .map(|items| items.iter().map(FirestoreValue::from_json).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(values) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_all(values)?)
        } else if let Some(values) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_all(values)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(FirestoreValue::from_json(operand)?)
        } else {
            return Err(invalid_argument(format!("Unknown field transform: {value}")));
        };
        Ok(FieldTransform::new(field, operation))
    }

    pub fn encode_mutation_result(&self, result: &MutationResult) -> JsonValue {
        let mut encoded = serde_json::Map::new();
        if !result.version.is_min() {
            encoded.insert("updateTime".into(), json!(encode_timestamp(result.version)));
        }
        if !result.transform_results.is_empty() {
            let values: Vec<JsonValue> = result.transform_results.iter().map(FirestoreValue::to_json).collect();
            encoded.insert("transformResults".into(), JsonValue::Array(values));
        }
        JsonValue::Object(encoded)
    }

    /// A result without `updateTime` (a verify or a no-op delete) takes the
    /// commit version.
    pub fn decode_mutation_result(&self, value: &JsonValue, commit_version: Timestamp) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime") {
            Some(time) => self.decode_timestamp(time)?,
            None => commit_version,
        };
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().map(FirestoreValue::from_json).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    /// `{database, addTarget}` for a target about to be watched.
    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        let mut add_target = serde_json::Map::new();
        add_target.insert("targetId".into(), json!(target_data.target_id));
        match target_data.target.document_key() {
            Some(key) => {
                add_target.insert("documents".into(), json!({ "documents": [self.document_name(&key)] }));
            }
            None => {
                add_target.insert("query".into(), encode_query_target(self, &target_data.target));
            }
        }
        if !target_data.resume_token.is_empty() {
            add_target.insert("resumeToken".into(), json!(BASE64_STANDARD.encode(&target_data.resume_token)));
        } else if !target_data.snapshot_version.is_min() {
            add_target.insert("readTime".into(), json!(encode_timestamp(target_data.snapshot_version)));
        }
        if let Some(expected_count) = target_data.expected_count {
            if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
                add_target.insert("expectedCount".into(), json!(expected_count));
            }
        }

        let mut request = serde_json::Map::new();
        request.insert("database".into(), json!(self.database_name()));
        request.insert("addTarget".into(), JsonValue::Object(add_target));
        if let Some(label) = purpose_label(target_data.purpose) {
            request.insert("labels".into(), json!({ "goog-listen-tags": label }));
        }
        JsonValue::Object(request)
    }

    pub fn encode_unwatch_request(&self, target_id: i32) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn decode_listen_request(&self, value: &JsonValue) -> FirestoreResult<ListenRequest> {
        if let Some(target_id) = value.get("removeTarget").and_then(JsonValue::as_i64) {
            return Ok(ListenRequest::RemoveTarget(target_id as i32));
        }
        let add_target = value
            .get("addTarget")
            .ok_or_else(|| invalid_argument(format!("Unknown listen request: {value}")))?;
        let target_id = add_target
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("addTarget is missing targetId"))? as i32;
        let query = if let Some(documents) = add_target.get("documents") {
            let name = documents
                .get("documents")
                .and_then(JsonValue::as_array)
                .and_then(|names| names.first())
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Document target needs exactly one document"))?;
            Query::document(&self.decode_document_key(name)?)
        } else if let Some(query) = add_target.get("query") {
            decode_query_target(self, query)?
        } else {
            return Err(invalid_argument("addTarget needs a query or documents"));
        };
        let resume_token = add_target
            .get("resumeToken")
            .and_then(JsonValue::as_str)
            .map(|token| BASE64_STANDARD.decode(token))
            .transpose()
            .map_err(|err| invalid_argument(format!("Invalid resume token: {err}")))?
            .unwrap_or_default();
        let read_time = add_target
            .get("readTime")
            .map(|time| self.decode_timestamp(time))
            .transpose()?;
        let expected_count = add_target
            .get("expectedCount")
            .and_then(JsonValue::as_i64)
            .map(|count| count as i32);
        Ok(ListenRequest::AddTarget {
            target_id,
            query,
            resume_token,
            read_time,
            expected_count,
        })
    }

    pub fn encode_handshake(&self) -> JsonValue {
        json!({ "database": self.database_name() })
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        let writes: Vec<JsonValue> = mutations.iter().map(|mutation| self.encode_mutation(mutation)).collect();
        json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        })
    }

    pub fn decode_write_request(&self, value: &JsonValue) -> FirestoreResult<WriteRequest> {
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| BASE64_STANDARD.decode(token))
            .transpose()
            .map_err(|err| invalid_argument(format!("Invalid stream token: {err}")))?;
        let mut writes = Vec::new();
        if let Some(encoded) = value.get("writes").and_then(JsonValue::as_array) {
            for write in encoded {
                writes.push(self.decode_mutation(write)?);
            }
        }
        Ok(WriteRequest { stream_token, writes })
    }

    pub fn encode_write_response(&self, response: &WriteResponse) -> JsonValue {
        let mut encoded = serde_json::Map::new();
        encoded.insert("streamToken".into(), json!(BASE64_STANDARD.encode(&response.stream_token)));
        if !response.commit_version.is_min() {
            encoded.insert("commitTime".into(), json!(encode_timestamp(response.commit_version)));
        }
        let results: Vec<JsonValue> = response
            .write_results
            .iter()
            .map(|result| self.encode_mutation_result(result))
            .collect();
        encoded.insert("writeResults".into(), JsonValue::Array(results));
        JsonValue::Object(encoded)
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| BASE64_STANDARD.decode(token))
            .transpose()
            .map_err(|err| invalid_argument(format!("Invalid stream token: {err}")))?
            .unwrap_or_default();
        let commit_version = match value.get("commitTime") {
            Some(time) => self.decode_timestamp(time)?,
            None => Timestamp::MIN,
        };
        let mut write_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            for result in results {
                write_results.push(self.decode_mutation_result(result, commit_version)?);
            }
        }
        Ok(WriteResponse {
            stream_token,
            commit_version,
            write_results,
        })
    }
}

fn purpose_label(purpose: TargetPurpose) -> Option<&'static str> {
    match purpose {
        TargetPurpose::Listen => None,
        TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
        TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
        TargetPurpose::LimboResolution => Some("limbo-document"),
    }
}

pub(crate) fn encode_timestamp(timestamp: Timestamp) -> String {
    match Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
    {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => format!("{}.{:09}Z", timestamp.seconds, timestamp.nanos),
    }
}

pub(crate) fn decode_timestamp_string(value: &str) -> FirestoreResult<Timestamp> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp {value}: {err}")))?;
    Ok(Timestamp::new(
        parsed.timestamp(),
        parsed.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::{Filter, Operator};
    use crate::firestore::core::query::{Direction, OrderBy};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn document_names_are_database_scoped() {
        let serializer = serializer();
        let name = serializer.document_name(&key("rooms/a"));
        assert_eq!(name, "projects/p/databases/(default)/documents/rooms/a");
        assert_eq!(serializer.decode_document_key(&name).unwrap(), key("rooms/a"));
        assert!(serializer
            .decode_document_key("projects/other/databases/(default)/documents/rooms/a")
            .is_err());
    }

    #[test]
    fn timestamps_render_as_rfc3339_with_nanos() {
        let encoded = encode_timestamp(Timestamp::new(1, 500));
        assert_eq!(encoded, "1970-01-01T00:00:01.000000500Z");
        assert_eq!(decode_timestamp_string(&encoded).unwrap(), Timestamp::new(1, 500));
        assert_eq!(
            serializer().decode_timestamp(&json!({"seconds": "3", "nanos": 4})).unwrap(),
            Timestamp::new(3, 4)
        );
    }

    #[test]
    fn patch_with_transform_and_precondition_encodes_wire_shape() {
        let serializer = serializer();
        let mut data = MapValue::empty();
        data.set(&field("a"), FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(key("rooms/a"), data, FieldMask::new([field("a")])).with_transforms(vec![
            FieldTransform::new(field("count"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(2))),
        ]);

        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["a"]));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(encoded["updateTransforms"][0]["fieldPath"], json!("count"));
        assert_eq!(encoded["updateTransforms"][0]["increment"], json!({ "integerValue": "2" }));

        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn listen_request_prefers_resume_token_and_sends_expected_count() {
        let serializer = serializer();
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .unwrap()
            .with_filter(Filter::field(field("size"), Operator::GreaterThan, FirestoreValue::from_integer(3)))
            .with_order_by(OrderBy::new(field("size"), Direction::Descending))
            .with_limit_to_first(5);
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![9, 9], Timestamp::new(10, 0))
            .with_expected_count(3);

        let encoded = serializer.encode_listen_request(&target_data);
        assert_eq!(encoded["database"], json!("projects/p/databases/(default)"));
        assert_eq!(encoded["addTarget"]["resumeToken"], json!(BASE64_STANDARD.encode([9, 9])));
        assert!(encoded["addTarget"].get("readTime").is_none());
        assert_eq!(encoded["addTarget"]["expectedCount"], json!(3));
        assert_eq!(
            encoded["addTarget"]["query"]["parent"],
            json!("projects/p/databases/(default)/documents")
        );

        match serializer.decode_listen_request(&encoded).unwrap() {
            ListenRequest::AddTarget {
                target_id,
                query: decoded,
                resume_token,
                expected_count,
                ..
            } => {
                assert_eq!(target_id, 2);
                assert_eq!(resume_token, vec![9, 9]);
                assert_eq!(expected_count, Some(3));
                assert_eq!(decoded.to_target(), query.to_target());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn limbo_targets_use_document_form_and_labels() {
        let serializer = serializer();
        let target = Query::document(&key("rooms/a")).to_target();
        let target_data = TargetData::new(target, 5, TargetPurpose::LimboResolution, 1);
        let encoded = serializer.encode_listen_request(&target_data);
        assert_eq!(
            encoded["addTarget"]["documents"]["documents"],
            json!(["projects/p/databases/(default)/documents/rooms/a"])
        );
        assert_eq!(encoded["labels"]["goog-listen-tags"], json!("limbo-document"));
        assert!(encoded["addTarget"].get("expectedCount").is_none());
    }

    #[test]
    fn write_request_round_trips_token_and_writes() {
        let serializer = serializer();
        let writes = vec![Mutation::delete(key("rooms/a"))];
        let encoded = serializer.encode_write_request(&[1, 2], &writes);
        let decoded = serializer.decode_write_request(&encoded).unwrap();
        assert_eq!(decoded.stream_token, Some(vec![1, 2]));
        assert_eq!(decoded.writes, writes);
    }
}
