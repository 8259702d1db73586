mod ascii;
mod payloads;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::PROTOCOL_VERSION;
use crate::time::utc_now_iso;

pub use payloads::*;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad json: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    InvalidPayload(serde_json::Error),
    #[error("missing {0}")]
    MissingField(&'static str),
}

/// Generate a fresh correlator / reservation / internal id.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Top-level message wrapper carried in every WebSocket text frame.
///
/// The payload stays an untyped object so unrecognized fields round-trip;
/// handlers decode it into one of the typed payload structs with
/// [`parse_payload`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default = "utc_now_iso")]
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: kind.into(),
            id: new_id(),
            ts: utc_now_iso(),
            org_id: None,
            from_node: None,
            to_node: None,
            payload: empty_object(),
        }
    }

    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        let mut env = Self::new(kind);
        env.payload = payload;
        env
    }

    pub fn from_node(mut self, node_id: impl Into<String>) -> Self {
        self.from_node = Some(node_id.into());
        self
    }

    /// Build a reply that preserves this request's correlator.
    pub fn reply(&self, kind: impl Into<String>, payload: Value) -> Envelope {
        let mut env = Envelope::with_payload(kind, payload);
        env.id = self.id.clone();
        env
    }

    /// Build an `error` reply with a short human-readable message.
    pub fn error_reply(&self, message: impl Into<String>) -> Envelope {
        self.reply(
            "error",
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Compact, ASCII-safe JSON for the wire.
    pub fn to_json(&self) -> String {
        ascii::to_ascii_json(self)
    }

    pub fn from_json(data: &str) -> Result<Envelope, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Decode the envelope payload into a typed request/response struct.
/// Unknown fields are ignored for forward compatibility.
pub fn parse_payload<T: serde::de::DeserializeOwned>(env: &Envelope) -> Result<T, ProtocolError> {
    serde_json::from_value(env.payload.clone()).map_err(ProtocolError::InvalidPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_fields() -> Result<(), ProtocolError> {
        let mut env = Envelope::with_payload("ping", serde_json::json!({"k": 1}));
        env.from_node = Some("node-a".to_string());
        let encoded = env.to_json();
        let decoded = Envelope::from_json(&encoded)?;
        assert_eq!(decoded.v, PROTOCOL_VERSION);
        assert_eq!(decoded.kind, "ping");
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.from_node.as_deref(), Some("node-a"));
        assert_eq!(decoded.payload["k"], 1);
        Ok(())
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let mut env = Envelope::new("list");
        env.org_id = Some("org".to_string());
        env.from_node = Some("a".to_string());
        env.to_node = Some("b".to_string());
        let encoded = env.to_json();
        assert!(encoded.contains("\"orgId\""));
        assert!(encoded.contains("\"fromNode\""));
        assert!(encoded.contains("\"toNode\""));
        assert!(encoded.contains("\"type\":\"list\""));
    }

    #[test]
    fn missing_optional_fields_are_defaulted() -> Result<(), ProtocolError> {
        let decoded = Envelope::from_json(r#"{"type":"ping"}"#)?;
        assert_eq!(decoded.v, PROTOCOL_VERSION);
        assert!(!decoded.id.is_empty());
        assert!(decoded.payload.is_object());
        Ok(())
    }

    #[test]
    fn output_is_ascii_and_compact() {
        let env = Envelope::with_payload("task_run", serde_json::json!({"prompt": "héllo ✓"}));
        let encoded = env.to_json();
        assert!(encoded.is_ascii());
        assert!(!encoded.contains("\": \""));
        assert!(encoded.contains("h\\u00e9llo \\u2713"));
    }

    #[test]
    fn unknown_payload_fields_round_trip() -> Result<(), ProtocolError> {
        let raw = r#"{"type":"register","payload":{"nodeId":"n","futureField":{"x":1}}}"#;
        let env = Envelope::from_json(raw)?;
        let encoded = env.to_json();
        let again = Envelope::from_json(&encoded)?;
        assert_eq!(again.payload["futureField"]["x"], 1);
        Ok(())
    }

    #[test]
    fn reply_preserves_request_id() {
        let req = Envelope::new("reserve");
        let ok = req.reply("reserve_ok", serde_json::json!({"reservationId": "r1"}));
        assert_eq!(ok.id, req.id);
        let err = req.error_reply("insufficient balance");
        assert_eq!(err.id, req.id);
        assert_eq!(err.payload["message"], "insufficient balance");
    }

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
