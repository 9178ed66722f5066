//! JSON-RPC 2.0 message codec for WebSocket text frames.
//!
//! WebSocket frames already delimit messages, so unlike a stream transport no
//! Content-Length header is needed: one frame carries exactly one JSON object.
//!
//! # Wire Format
//!
//! ```text
//! -> {"jsonrpc":"2.0","method":"loader_tool","params":[],"id":1}
//! <- {"jsonrpc":"2.0","result":"ok","id":1}
//! <- {"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found","data":""},"id":1}
//! ```
//!
//! Inbound messages are classified by the presence of exactly one of the
//! `result` or `error` keys. Anything else is [`DecodedMessage::Malformed`].

use serde_json::{Map, Value};

use crate::ipc::client::IpcError;
use crate::protocol::{RpcCall, RpcError, RpcResponseError, RpcResponseResult};

/// Maximum inbound message size (16MB).
///
/// The WebSocket transport enforces this while reading; [`decode`] checks it
/// again for payloads arriving through other transports.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage {
    /// Successful reply.
    ResultMessage(RpcResponseResult),
    /// Error reply.
    ErrorMessage(RpcResponseError),
    /// Anything that is not exactly one of the above.
    Malformed {
        /// Frame payload as received.
        raw: Vec<u8>,
        /// Why classification failed, for logs.
        reason: String,
    },
}

impl DecodedMessage {
    fn malformed(raw: &[u8], reason: impl Into<String>) -> Self {
        DecodedMessage::Malformed {
            raw: raw.to_vec(),
            reason: reason.into(),
        }
    }
}

/// Encode a call as a JSON-RPC 2.0 request object.
///
/// # Errors
///
/// Returns `IpcError::Protocol` if serialization fails, which cannot happen
/// for the string-only shape of [`RpcCall`] but is propagated rather than
/// assumed.
pub fn encode(call: &RpcCall) -> Result<String, IpcError> {
    serde_json::to_string(call)
        .map_err(|e| IpcError::Protocol(format!("Failed to serialize call: {}", e)))
}

/// Decode one inbound frame.
///
/// Decoding never fails; problems are reported as [`DecodedMessage::Malformed`].
pub fn decode(raw: &[u8]) -> DecodedMessage {
    if raw.len() > MAX_MESSAGE_SIZE {
        return DecodedMessage::malformed(
            raw,
            format!(
                "Message size {} exceeds maximum {} bytes",
                raw.len(),
                MAX_MESSAGE_SIZE
            ),
        );
    }

    let root: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(e) => return DecodedMessage::malformed(raw, format!("Invalid JSON: {}", e)),
    };

    let Some(obj) = root.as_object() else {
        return DecodedMessage::malformed(raw, "Top-level value is not an object");
    };

    let Some(id) = obj.get("id").and_then(Value::as_u64) else {
        return DecodedMessage::malformed(raw, "Missing or non-integer id");
    };

    let jsonrpc = obj
        .get("jsonrpc")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => DecodedMessage::ResultMessage(RpcResponseResult {
            jsonrpc,
            result: value_to_text(result),
            id,
        }),
        (None, Some(error)) => match decode_error(error) {
            Some(error) => DecodedMessage::ErrorMessage(RpcResponseError { jsonrpc, error, id }),
            None => DecodedMessage::malformed(raw, "Error member is not a valid error object"),
        },
        (Some(_), Some(_)) => DecodedMessage::malformed(raw, "Both result and error present"),
        (None, None) => DecodedMessage::malformed(raw, "Neither result nor error present"),
    }
}

/// Parse the `error` member; `code` is mandatory, the rest default to empty.
fn decode_error(value: &Value) -> Option<RpcError> {
    let obj: &Map<String, Value> = value.as_object()?;
    let code = obj.get("code")?.as_i64()?;
    let message = obj.get("message").map(value_to_text).unwrap_or_default();
    let data = obj.get("data").map(value_to_text).unwrap_or_default();

    Some(RpcError {
        code,
        message,
        data,
    })
}

/// Strings are taken verbatim; other values keep their JSON text.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
