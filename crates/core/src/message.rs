//! Wire-level envelopes and validation helpers for the JSON control API
//!
//! Every reply carries `janus: <status>` plus the echoed `transaction`, so
//! clients can correlate asynchronous responses with their requests.

use serde_json::{json, Value};

use crate::error::{codes, ApiError};

/// Build a reply envelope: `{janus: <status>, session_id?, transaction?}`
pub fn envelope(status: &str, session_id: u64, transaction: Option<&str>) -> Value {
    let mut msg = json!({ "janus": status });
    if session_id > 0 {
        msg["session_id"] = json!(session_id);
    }
    if let Some(transaction) = transaction {
        msg["transaction"] = json!(transaction);
    }
    msg
}

/// Build an error reply for the given API error
pub fn error_reply(session_id: u64, transaction: Option<&str>, err: &ApiError) -> Value {
    let mut msg = envelope("error", session_id, transaction);
    msg["error"] = json!({
        "code": err.code,
        "reason": err.reason,
    });
    msg
}

/// Mandatory string element: missing and wrong-type cases map to the two
/// distinct validation error codes the protocol distinguishes.
pub fn require_str<'a>(root: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    match root.get(key) {
        None => Err(ApiError::new(
            codes::MISSING_MANDATORY_ELEMENT,
            format!("Missing mandatory element ({key})"),
        )),
        Some(value) => value.as_str().ok_or_else(|| {
            ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                format!("Invalid element type ({key} should be a string)"),
            )
        }),
    }
}

/// Mandatory JSON-object element
pub fn require_object<'a>(root: &'a Value, key: &str) -> Result<&'a Value, ApiError> {
    match root.get(key) {
        None => Err(ApiError::new(
            codes::MISSING_MANDATORY_ELEMENT,
            format!("Missing mandatory element ({key})"),
        )),
        Some(value) if value.is_object() => Ok(value),
        Some(_) => Err(ApiError::new(
            codes::INVALID_ELEMENT_TYPE,
            format!("Invalid element type ({key} should be an object)"),
        )),
    }
}

/// Mandatory non-negative integer element
pub fn require_u64(root: &Value, key: &str) -> Result<u64, ApiError> {
    match root.get(key) {
        None => Err(ApiError::new(
            codes::MISSING_MANDATORY_ELEMENT,
            format!("Missing mandatory element ({key})"),
        )),
        Some(value) => value.as_u64().ok_or_else(|| {
            ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                format!("Invalid element type ({key} should be a positive integer)"),
            )
        }),
    }
}

/// Mandatory boolean element
pub fn require_bool(root: &Value, key: &str) -> Result<bool, ApiError> {
    match root.get(key) {
        None => Err(ApiError::new(
            codes::MISSING_MANDATORY_ELEMENT,
            format!("Missing mandatory element ({key})"),
        )),
        Some(value) => value.as_bool().ok_or_else(|| {
            ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                format!("Invalid element type ({key} should be a boolean)"),
            )
        }),
    }
}

/// Optional integer id (`session_id`, `handle_id`): absent is fine, a
/// non-integer value is an element-type error.
pub fn optional_u64(root: &Value, key: &str) -> Result<Option<u64>, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                format!("Invalid element type ({key} should be a positive integer)"),
            )
        }),
    }
}

/// Optional string element
pub fn optional_str<'a>(root: &'a Value, key: &str) -> Result<Option<&'a str>, ApiError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_str().map(Some).ok_or_else(|| {
            ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                format!("Invalid element type ({key} should be a string)"),
            )
        }),
    }
}
