//! Message envelope for the JSON-RPC control channel
//!
//! Defines request/notification/response construction, incoming-message
//! parsing, and the tagged encoding used to smuggle raw byte buffers
//! through the JSON payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Envelope errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("value is not JSON serializable: {0}")]
    Unrepresentable(#[from] serde_json::Error),

    #[error("frame payload is not a JSON object")]
    NotAnObject,

    #[error("message field '{0}' is missing or malformed")]
    BadField(&'static str),
}

/// Key marking a tagged byte buffer inside the JSON payload.
const BYTEARRAY_TAG: &str = "__bytearray__";

/// An outbound request carrying a fresh correlation id.
#[derive(Debug, Clone)]
pub struct Request {
    /// Process-unique correlation token, echoed verbatim by the server.
    pub id: String,
    pub method: String,
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(method: &str, params: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "method": self.method,
            "params": Value::Object(self.params.clone()),
        })
    }
}

/// An outbound notification: request-shaped, no id, no structured response.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Map<String, Value>,
}

impl Notification {
    pub fn new(method: &str, params: Map<String, Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": Value::Object(self.params.clone()),
        })
    }
}

/// A decoded inbound message, routed by the presence of an id.
#[derive(Debug)]
pub enum Incoming {
    Request {
        id: String,
        method: String,
        params: Map<String, Value>,
    },
    Notification {
        method: String,
        params: Map<String, Value>,
    },
}

impl Incoming {
    /// Parse a decoded frame into a request or notification.
    pub fn parse(value: Value) -> Result<Self, MessageError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(MessageError::NotAnObject),
        };

        let method = match obj.remove("method") {
            Some(Value::String(m)) => m,
            _ => return Err(MessageError::BadField("method")),
        };

        let params = match obj.remove("params") {
            Some(Value::Object(p)) => p,
            None => Map::new(),
            _ => return Err(MessageError::BadField("params")),
        };

        match obj.remove("id") {
            Some(Value::String(id)) => Ok(Incoming::Request { id, method, params }),
            Some(_) => Err(MessageError::BadField("id")),
            None => Ok(Incoming::Notification { method, params }),
        }
    }
}

/// Build a success response, omitting `result` when there is no payload.
pub fn response(id: &str, result: Option<Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!("2.0"));
    obj.insert("id".into(), json!(id));
    if let Some(result) = result {
        obj.insert("result".into(), result);
    }
    Value::Object(obj)
}

/// Build an error response. `data` is merged over the `{ip, port}` base
/// carried by every error payload.
pub fn error_response(
    id: &str,
    code: i64,
    message: &str,
    ip: &str,
    port: u16,
    data: Map<String, Value>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("ip".into(), json!(ip));
    payload.insert("port".into(), json!(port));
    payload.extend(data);
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message, "data": Value::Object(payload) },
    })
}

/// Build a live-output frame interleaved with a pending call's response.
pub fn live_output(stream: LiveStream, text: &str) -> Value {
    match stream {
        LiveStream::Stdout => json!({ "live_stdout": text }),
        LiveStream::Stderr => json!({ "live_stderr": text }),
    }
}

/// Which standard stream a live-output frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStream {
    Stdout,
    Stderr,
}

/// Client-side classification of one received frame against a pending id.
#[derive(Debug)]
pub enum Reply {
    /// Terminal frame carrying `result` for the outstanding id.
    Result(Value),
    /// Terminal frame carrying `error` for the outstanding id.
    Error {
        code: i64,
        message: String,
        data: Map<String, Value>,
    },
    /// Terminal frame for the outstanding id with neither key.
    Void,
    /// Interleaved live-output frame; the call is still pending.
    Live(LiveStream, String),
    /// Frame unrelated to the outstanding call.
    Unrelated,
}

impl Reply {
    pub fn classify(frame: Value, pending_id: &str) -> Self {
        let mut obj = match frame {
            Value::Object(obj) => obj,
            _ => return Reply::Unrelated,
        };

        if obj.get("id").and_then(Value::as_str) == Some(pending_id) {
            if let Some(result) = obj.remove("result") {
                return Reply::Result(result);
            }
            if let Some(Value::Object(mut err)) = obj.remove("error") {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = match err.remove("data") {
                    Some(Value::Object(data)) => data,
                    _ => Map::new(),
                };
                return Reply::Error { code, message, data };
            }
            return Reply::Void;
        }

        if let Some(text) = obj.get("live_stdout").and_then(Value::as_str) {
            return Reply::Live(LiveStream::Stdout, text.to_string());
        }
        if let Some(text) = obj.get("live_stderr").and_then(Value::as_str) {
            return Reply::Live(LiveStream::Stderr, text.to_string());
        }

        Reply::Unrelated
    }
}

/// Wrap raw bytes as the tagged wire representation:
/// `{"__bytearray__": true, "data": <base64>}`.
pub fn wire_bytes(data: &[u8]) -> Value {
    json!({ BYTEARRAY_TAG: true, "data": BASE64.encode(data) })
}

/// Unwrap a tagged byte buffer. Returns `None` for any value that does not
/// carry the tag; the tag is recognized by key presence alone.
pub fn bytes_from_wire(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if !obj.contains_key(BYTEARRAY_TAG) {
        return None;
    }
    let data = obj.get("data")?.as_str()?;
    BASE64.decode(data).ok()
}

/// Convert a caller-side value into its wire representation, failing
/// locally before any I/O when the value cannot be represented as JSON.
pub fn to_wire<T: Serialize>(value: &T) -> Result<Value, MessageError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CODE_INTERNAL_ERROR;

    #[test]
    fn test_request_shape() {
        let mut params = Map::new();
        params.insert("code".into(), json!("x = 1"));
        let req = Request::new("code_exec", params);
        let value = req.to_value();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "code_exec");
        assert_eq!(value["params"]["code"], "x = 1");
        assert_eq!(value["id"].as_str().unwrap(), req.id);
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = Notification::new("file_transfer_to_client", Map::new());
        let value = note.to_value();
        assert!(value.get("id").is_none());

        match Incoming::parse(value).unwrap() {
            Incoming::Notification { method, .. } => {
                assert_eq!(method, "file_transfer_to_client");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_incoming_request_roundtrip() {
        let mut params = Map::new();
        params.insert("name".into(), json!("f"));
        let req = Request::new("func_exec", params);

        match Incoming::parse(req.to_value()).unwrap() {
            Incoming::Request { id, method, params } => {
                assert_eq!(id, req.id);
                assert_eq!(method, "func_exec");
                assert_eq!(params["name"], "f");
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_result_and_void() {
        let frame = response("abc", Some(json!({"return": 5})));
        match Reply::classify(frame, "abc") {
            Reply::Result(v) => assert_eq!(v["return"], 5),
            other => panic!("expected result, got {:?}", other),
        }

        match Reply::classify(response("abc", None), "abc") {
            Reply::Void => {}
            other => panic!("expected void, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_carries_endpoint_base() {
        let mut data = Map::new();
        data.insert("stacktrace".into(), json!("boom"));
        let frame = error_response("abc", CODE_INTERNAL_ERROR, "", "127.0.0.1", 2305, data);

        match Reply::classify(frame, "abc") {
            Reply::Error { code, data, .. } => {
                assert_eq!(code, CODE_INTERNAL_ERROR);
                assert_eq!(data["stacktrace"], "boom");
                assert_eq!(data["ip"], "127.0.0.1");
                assert_eq!(data["port"], 2305);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_live_and_unrelated() {
        let live = json!({"live_stdout": "hi"});
        match Reply::classify(live, "abc") {
            Reply::Live(LiveStream::Stdout, text) => assert_eq!(text, "hi"),
            other => panic!("expected live stdout, got {:?}", other),
        }

        // A response keyed to someone else's id is ignored, not terminal.
        let foreign = response("other", Some(json!(1)));
        assert!(matches!(Reply::classify(foreign, "abc"), Reply::Unrelated));
    }

    #[test]
    fn test_bytes_roundtrip() {
        for payload in [
            Vec::new(),
            vec![0xde, 0xad, 0xbe, 0xef],
            (0..80_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
        ] {
            let tagged = wire_bytes(&payload);
            let text = serde_json::to_string(&tagged).unwrap();
            let back: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(bytes_from_wire(&back).unwrap(), payload);
        }
    }

    #[test]
    fn test_untagged_values_pass_through() {
        assert!(bytes_from_wire(&json!({"data": "AAAA"})).is_none());
        assert!(bytes_from_wire(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn test_to_wire_rejects_unrepresentable_values() {
        // Map keys must be strings in JSON; tuple keys fail locally,
        // before any network I/O happens.
        let bad: std::collections::HashMap<(u8, u8), i32> =
            std::collections::HashMap::from([((1, 2), 3)]);
        assert!(matches!(
            to_wire(&bad),
            Err(MessageError::Unrepresentable(_))
        ));
        assert_eq!(to_wire(&3i64).unwrap(), json!(3));
    }
}
