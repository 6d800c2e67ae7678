//! Line-delimited JSON-RPC framing for the protocol probe.
//!
//! Every outbound message is one JSON object on one line, newline
//! terminated and flushed immediately. Every inbound line is one JSON
//! object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Write};

pub const JSONRPC_VERSION: &str = "2.0";

/// Named parameters; opaque to the harness.
pub type Params = Map<String, Value>;

/// Request or notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Notification,
}

/// Outbound JSON-RPC message. Requests carry an `id`; notifications never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Params,
}

impl RpcEnvelope {
    pub fn request(id: u64, method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        if self.id.is_some() {
            EnvelopeKind::Request
        } else {
            EnvelopeKind::Notification
        }
    }

    /// Serialize to a single newline-terminated line.
    pub fn encode_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Write one envelope as one line and flush.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &RpcEnvelope) -> io::Result<()> {
    let line = envelope.encode_line().map_err(io::Error::from)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

/// Inbound message as received. Key presence matters (`"result": null` is
/// still a result), so the raw object is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    raw: Map<String, Value>,
}

impl RpcResponse {
    pub fn id(&self) -> Option<&Value> {
        self.raw.get("id")
    }

    pub fn has_result(&self) -> bool {
        self.raw.contains_key("result")
    }

    pub fn result(&self) -> Option<&Value> {
        self.raw.get("result")
    }

    pub fn error(&self) -> Option<&Value> {
        self.raw.get("error")
    }

    pub fn method(&self) -> Option<&str> {
        self.raw.get("method").and_then(Value::as_str)
    }

    /// A server-originated notification: has a method and no id.
    pub fn is_notification(&self) -> bool {
        self.method().is_some() && self.id().is_none()
    }

    /// A server-originated request: has both a method and an id.
    pub fn is_server_request(&self) -> bool {
        self.method().is_some() && self.id().is_some()
    }

    /// True when the `id` equals the numeric correlation id.
    pub fn answers(&self, id: u64) -> bool {
        self.id().and_then(Value::as_u64) == Some(id)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.raw)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

/// Why an inbound line was rejected.
#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    NotAnObject(Value),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "unparsable JSON: {}", e),
            DecodeError::NotAnObject(v) => write!(f, "expected a JSON object, got {}", v),
        }
    }
}

/// Decode one inbound line. Blank lines carry no message and yield `None`.
pub fn decode_line(line: &str) -> Result<Option<RpcResponse>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(trimmed).map_err(DecodeError::Json)? {
        Value::Object(raw) => Ok(Some(RpcResponse { raw })),
        other => Err(DecodeError::NotAnObject(other)),
    }
}

/// Build a params map from a `json!` object literal; non-objects become empty.
pub fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let req = RpcEnvelope::request(1, "tools/list", Params::new());
        let line = req.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}})
        );
        assert_eq!(req.kind(), EnvelopeKind::Request);
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = RpcEnvelope::notification("initialized", Params::new());
        let line = note.encode_line().unwrap();
        assert!(!line.contains("\"id\""));
        assert_eq!(note.kind(), EnvelopeKind::Notification);
    }

    #[test]
    fn test_multiline_params_stay_on_one_line() {
        let req = RpcEnvelope::request(
            7,
            "tools/call",
            params(json!({"arguments": {"query": "line one\nline two"}})),
        );
        let line = req.encode_line().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_result_null_counts_as_result() {
        let resp = decode_line(r#"{"jsonrpc":"2.0","id":3,"result":null}"#)
            .unwrap()
            .unwrap();
        assert!(resp.has_result());
        assert!(resp.answers(3));
        assert!(!resp.answers(4));
    }

    #[test]
    fn test_decode_error_response() {
        let resp = decode_line(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
            .unwrap()
            .unwrap();
        assert!(!resp.has_result());
        assert_eq!(resp.error().unwrap()["code"], -32601);
    }

    #[test]
    fn test_decode_blank_and_garbage() {
        assert!(decode_line("   \n").unwrap().is_none());
        assert!(matches!(decode_line("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_line("[1,2]"), Err(DecodeError::NotAnObject(_))));
    }

    #[test]
    fn test_server_notification_detection() {
        let resp = decode_line(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#)
            .unwrap()
            .unwrap();
        assert!(resp.is_notification());
        assert!(!resp.is_server_request());
    }

    #[test]
    fn test_write_envelope_flushes_one_line() {
        let mut buf = Vec::new();
        write_envelope(&mut buf, &RpcEnvelope::request(2, "ping", Params::new())).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with('\n'));
    }
}
