//! Wire codec for the tunnel connection.
//!
//! Every WebSocket text frame carries one JSON object with a `type` field.
//!
//! | Direction      | `type`      | Fields                                         |
//! |----------------|-------------|------------------------------------------------|
//! | relay → client | `welcome`   | `client_id` on success, `error` on rejection   |
//! | both           | `ping`      | optional `ts` (ms since UNIX epoch)            |
//! | both           | `pong`      | `ts` echoed from the ping, if any              |
//! | relay → client | `request`   | `id`, `method`, `path`, `headers`, `query?`, `body?` |
//! | client → relay | `response`  | `id`, `status`, `headers`, `body`              |
//! | client → relay | `sse_event` | `id`, `data` (one event-stream line)           |
//! | client → relay | `sse_end`   | `id`                                           |
//!
//! Bodies are base64. Frames are decoded once, here, into [`RelayMessage`];
//! nothing past this module looks at raw JSON.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Why an inbound frame could not be turned into a [`RelayMessage`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("invalid base64 body: {0}")]
    InvalidBody(#[from] base64::DecodeError),
}

/// Messages the relay sends to us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Welcome(Welcome),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Request(InboundRequest),
    #[serde(other)]
    Unknown,
}

/// Handshake result. Exactly one of the fields is expected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Welcome {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of `ping` / `pong` in either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// A proxied HTTP call issued by the relay.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundRequest {
    /// Correlation id, echoed on every frame we send for this request.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "string_map")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "string_map")]
    pub query: HashMap<String, String>,
    /// Base64 request body.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl InboundRequest {
    /// Decoded body bytes. An absent or empty body yields an empty vec.
    pub fn body_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self.body.as_deref().map(str::trim) {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => decode_body(raw),
        }
    }
}

/// Messages we send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping(Heartbeat),
    Pong(Heartbeat),
    Response(Response),
    SseEvent { id: String, data: String },
    SseEnd { id: String },
}

impl ClientMessage {
    /// A heartbeat ping stamped with the current time.
    pub fn ping_now() -> Self {
        Self::Ping(Heartbeat {
            ts: Some(unix_millis()),
        })
    }

    /// Correlation id for request-scoped frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Response(r) => Some(&r.id),
            Self::SseEvent { id, .. } | Self::SseEnd { id } => Some(id),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }
}

/// Terminal single-shot result for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub id: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Base64 response body.
    pub body: String,
}

impl Response {
    pub fn new(id: &str, status: u16, headers: BTreeMap<String, String>, body: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            status,
            headers,
            body: STANDARD.encode(body),
        }
    }

    /// A JSON `{"detail": ...}` error response.
    pub fn error(id: &str, status: u16, detail: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let body = json!({ "detail": detail }).to_string();
        Self::new(id, status, headers, body.as_bytes())
    }

    /// Decoded body bytes (used by tests and logging).
    pub fn body_bytes(&self) -> Result<Vec<u8>, CodecError> {
        decode_body(&self.body)
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<RelayMessage, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();
    match serde_json::from_value(value)? {
        RelayMessage::Unknown => Err(CodecError::UnknownKind(kind)),
        message => Ok(message),
    }
}

/// Encode one outbound frame.
pub fn encode(message: &ClientMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode base64, accepting the url-safe alphabet and missing padding.
pub fn decode_body(raw: &str) -> Result<Vec<u8>, CodecError> {
    let normalized: String = raw
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    Ok(STANDARD_NO_PAD.decode(normalized)?)
}

/// Milliseconds since the UNIX epoch (0 if the clock is before 1970).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Accept a JSON object of scalars (or null) as a string map.
///
/// Relays are not consistent about stringifying query values, so numbers and
/// booleans are rendered with their JSON text; nested values are dropped.
fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Number(n) => Some((k, n.to_string())),
            Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_welcome_success_and_rejection() {
        let ok = decode(r#"{"type":"welcome","client_id":"c-42"}"#).unwrap();
        assert_eq!(
            ok,
            RelayMessage::Welcome(Welcome {
                client_id: Some("c-42".into()),
                error: None,
            })
        );

        let rejected = decode(r#"{"type":"welcome","error":"invalid license"}"#).unwrap();
        let RelayMessage::Welcome(w) = rejected else {
            panic!("expected welcome");
        };
        assert_eq!(w.error.as_deref(), Some("invalid license"));
        assert!(w.client_id.is_none());
    }

    #[test]
    fn test_decode_ping_with_and_without_ts() {
        assert_eq!(
            decode(r#"{"type":"ping"}"#).unwrap(),
            RelayMessage::Ping(Heartbeat { ts: None })
        );
        assert_eq!(
            decode(r#"{"type":"ping","ts":1700000000000}"#).unwrap(),
            RelayMessage::Ping(Heartbeat {
                ts: Some(1_700_000_000_000)
            })
        );
    }

    #[test]
    fn test_decode_request_full() {
        let text = r#"{
            "type": "request",
            "id": "r1",
            "method": "post",
            "path": "/api/v1/send",
            "headers": {"Content-Type": "application/json"},
            "query": {"page": 2, "dry": true, "q": "x", "nested": {"a": 1}},
            "body": "eyJhIjoxfQ"
        }"#;
        let RelayMessage::Request(req) = decode(text).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.id, "r1");
        assert_eq!(req.method, "post");
        assert_eq!(req.headers["Content-Type"], "application/json");
        assert_eq!(req.query["page"], "2");
        assert_eq!(req.query["dry"], "true");
        assert_eq!(req.query["q"], "x");
        assert!(!req.query.contains_key("nested"));
        assert_eq!(req.body_bytes().unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn test_decode_request_minimal() {
        let RelayMessage::Request(req) =
            decode(r#"{"type":"request","id":"r2","path":"/","query":null}"#).unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
        assert!(req.query.is_empty());
        assert!(req.body_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(r#"{"id":"x"}"#), Err(CodecError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"teleport"}"#),
            Err(CodecError::UnknownKind(k)) if k == "teleport"
        ));
        assert!(matches!(
            decode(r#"{"type":"request","headers":"nope"}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_outbound_frames() {
        let resp = Response::error("r1", 403, "path not allowed");
        let v: Value = serde_json::from_str(&encode(&ClientMessage::Response(resp)).unwrap()).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["id"], "r1");
        assert_eq!(v["status"], 403);
        assert_eq!(v["headers"]["content-type"], "application/json");
        let body = decode_body(v["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, br#"{"detail":"path not allowed"}"#);

        let ev = encode(&ClientMessage::SseEvent {
            id: "s".into(),
            data: "data: hi".into(),
        })
        .unwrap();
        assert_eq!(ev, r#"{"type":"sse_event","id":"s","data":"data: hi"}"#);
        assert_eq!(
            encode(&ClientMessage::SseEnd { id: "s".into() }).unwrap(),
            r#"{"type":"sse_end","id":"s"}"#
        );
        assert_eq!(
            encode(&ClientMessage::Pong(Heartbeat { ts: Some(5) })).unwrap(),
            r#"{"type":"pong","ts":5}"#
        );
        assert_eq!(
            encode(&ClientMessage::Pong(Heartbeat::default())).unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn test_decode_body_variants() {
        assert_eq!(decode_body("aGk=").unwrap(), b"hi");
        assert_eq!(decode_body("aGk").unwrap(), b"hi");
        assert_eq!(decode_body("-_8").unwrap(), decode_body("+/8=").unwrap());
        assert!(decode_body("***").is_err());
    }
}
