//! Typed payload structs for every message kind on the wire.
//!
//! Decoding is lenient: every field has a default or is optional, and
//! unknown fields are ignored so older peers interoperate with newer ones.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::knowledge::PackMeta;
use crate::time::{TimestampMillis, TimestampSeconds};

fn default_price_points() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_version_string() -> String {
    "1.0".to_string()
}

/// `register` / `update` request payload (same fields for both).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub endpoint_url: String,
    /// Capability key -> truthy flag. Kept as raw values so peers may send
    /// anything truthy; the registry normalizes on upsert.
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    #[serde(default)]
    pub capability_card: Value,
    #[serde(default = "default_price_points")]
    pub price_points: u64,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterOkPayload {
    pub node_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPayload {
    #[serde(default = "default_true")]
    pub online_only: bool,
    #[serde(default)]
    pub require_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub registry_token: String,
}

impl Default for ListPayload {
    fn default() -> Self {
        Self {
            online_only: true,
            require_capabilities: Vec::new(),
            page: None,
            page_size: None,
            registry_token: String::new(),
        }
    }
}

/// Node shape returned by `list` and `leaderboard`.
///
/// Deliberately excludes `endpointUrl`: endpoints are only disclosed via
/// `resolve`, which requires a token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    #[serde(default)]
    pub capability_card: Value,
    #[serde(default = "default_price_points")]
    pub price_points: u64,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default)]
    pub earned_points: u64,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub spent_points: u64,
    #[serde(default)]
    pub held_points: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub avg_latency_ms: TimestampMillis,
    #[serde(default)]
    pub last_seen_ts: TimestampSeconds,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResultPayload {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub nodes: Vec<NodeSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvePayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOkPayload {
    pub node_id: String,
    pub endpoint_url: String,
    pub online: bool,
    pub last_seen_ts: TimestampSeconds,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservePayload {
    /// Provider node being reserved against.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub payer_node: String,
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveOkPayload {
    pub reservation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitPayload {
    #[serde(default)]
    pub reservation_id: String,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    #[serde(default)]
    pub reservation_id: String,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_node: Option<String>,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub latency_ms: TimestampMillis,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResultPayload {
    pub sort_by: String,
    pub limit: usize,
    pub nodes: Vec<NodeSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePublishPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_version_string")]
    pub version: String,
    #[serde(default)]
    pub owner_node: String,
    #[serde(default)]
    pub allow_update: bool,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgePublishOkPayload {
    pub id: String,
    pub size_bytes: usize,
    pub content_hash: String,
    pub updated_ts: TimestampSeconds,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeListPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeListResultPayload {
    pub packs: Vec<PackMeta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeGetPayload {
    #[serde(default)]
    pub id: String,
}

/// Node entry pushed by the federation bridge. Carries presentational
/// fields only; ledger and telemetry counters never cross registries.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNode {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
    #[serde(default)]
    pub capability_card: Value,
    #[serde(default = "default_price_points")]
    pub price_points: u64,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen_ts: TimestampSeconds,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub registry_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunPayload {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub service_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultPayload {
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHelloPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub relay_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHelloOkPayload {
    pub node_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequestPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub service_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub relay_token: String,
}

/// Frame forwarded from the relay to the target node. The relay rewrites
/// the envelope id to its internal pending id; the client's request id is
/// never disclosed to the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayTaskPayload {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub service_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResultPayload {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponsePayload {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Truthiness rule applied to raw capability values: JSON null, false, 0,
/// "" and empty containers are falsy, everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_payload, Envelope};

    #[test]
    fn register_payload_defaults() {
        let env = Envelope::with_payload("register", serde_json::json!({"nodeId": "n1"}));
        let payload: RegisterPayload = parse_payload(&env).unwrap();
        assert_eq!(payload.node_id.as_deref(), Some("n1"));
        assert_eq!(payload.price_points, 1);
        assert!(payload.endpoint_url.is_empty());
        assert!(payload.capabilities.is_empty());
    }

    #[test]
    fn list_payload_defaults_to_online_only() {
        let env = Envelope::with_payload("list", serde_json::json!({}));
        let payload: ListPayload = parse_payload(&env).unwrap();
        assert!(payload.online_only);
        assert!(payload.require_capabilities.is_empty());
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let env = Envelope::with_payload(
            "reserve",
            serde_json::json!({"nodeId": "p", "payerNode": "c", "points": 3, "futureFlag": true}),
        );
        let payload: ReservePayload = parse_payload(&env).unwrap();
        assert_eq!(payload.node_id, "p");
        assert_eq!(payload.payer_node, "c");
        assert_eq!(payload.points, 3);
    }

    #[test]
    fn node_summary_has_no_endpoint_field() {
        let summary = NodeSummary {
            node_id: "n".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert!(value.get("endpointUrl").is_none());
        assert_eq!(value["nodeId"], "n");
    }

    #[test]
    fn truthiness_matches_wire_contract() {
        assert!(truthy(&serde_json::json!(true)));
        assert!(truthy(&serde_json::json!(1)));
        assert!(truthy(&serde_json::json!("yes")));
        assert!(!truthy(&serde_json::json!(false)));
        assert!(!truthy(&serde_json::json!(0)));
        assert!(!truthy(&serde_json::json!("")));
        assert!(!truthy(&serde_json::json!(null)));
    }
}
