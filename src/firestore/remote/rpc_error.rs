use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// `google.rpc.Status` as it appears on stream responses and target causes.
#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: Option<JsonValue>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn grpc_code(code: FirestoreErrorCode) -> i32 {
    match code {
        FirestoreErrorCode::Cancelled => 1,
        FirestoreErrorCode::Unknown => 2,
        FirestoreErrorCode::InvalidArgument => 3,
        FirestoreErrorCode::DeadlineExceeded => 4,
        FirestoreErrorCode::NotFound => 5,
        FirestoreErrorCode::AlreadyExists => 6,
        FirestoreErrorCode::PermissionDenied => 7,
        FirestoreErrorCode::ResourceExhausted => 8,
        FirestoreErrorCode::FailedPrecondition => 9,
        FirestoreErrorCode::Aborted => 10,
        FirestoreErrorCode::OutOfRange => 11,
        FirestoreErrorCode::Unimplemented => 12,
        FirestoreErrorCode::Internal => 13,
        FirestoreErrorCode::Unavailable => 14,
        FirestoreErrorCode::DataLoss => 15,
        FirestoreErrorCode::Unauthenticated => 16,
    }
}

pub fn code_from_status_name(status: &str) -> FirestoreErrorCode {
    match status {
        "CANCELLED" => FirestoreErrorCode::Cancelled,
        "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
        "NOT_FOUND" => FirestoreErrorCode::NotFound,
        "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
        "ABORTED" => FirestoreErrorCode::Aborted,
        "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
        "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
        "INTERNAL" => FirestoreErrorCode::Internal,
        "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
        "DATA_LOSS" => FirestoreErrorCode::DataLoss,
        "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}

/// Encodes an error as a status payload, `{code, message}`.
pub fn encode_status(error: &FirestoreError) -> JsonValue {
    json!({
        "code": grpc_code(error.code),
        "message": error.message(),
    })
}

/// Reads a status payload. Numeric codes win over status names; an
/// unreadable payload becomes `Unknown`.
pub fn decode_status(value: &JsonValue) -> FirestoreError {
    let Ok(status) = serde_json::from_value::<RpcStatus>(value.clone()) else {
        return FirestoreError::new(FirestoreErrorCode::Unknown, format!("Unreadable status: {value}"));
    };
    let numeric = status.code.as_ref().and_then(|code| match code {
        JsonValue::Number(number) => number.as_i64(),
        JsonValue::String(raw) => raw.parse::<i64>().ok(),
        _ => None,
    });
    let code = match (numeric, status.status.as_deref()) {
        (Some(code), _) => FirestoreErrorCode::from_grpc_code(code as i32),
        (None, Some(name)) => code_from_status_name(name),
        (None, None) => FirestoreErrorCode::Unknown,
    };
    let message = status
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("Stream failed with {}", code.as_str()));
    FirestoreError::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, resource_exhausted};

    #[test]
    fn status_round_trips_through_numeric_code() {
        let error = resource_exhausted("slow down");
        let decoded = decode_status(&encode_status(&error));
        assert_eq!(decoded, error);
    }

    #[test]
    fn status_name_is_used_without_numeric_code() {
        let decoded = decode_status(&json!({ "status": "PERMISSION_DENIED", "message": "nope" }));
        assert_eq!(decoded, permission_denied("nope"));

        let unknown = decode_status(&json!("garbage"));
        assert_eq!(unknown.code, FirestoreErrorCode::Unknown);
    }
}
