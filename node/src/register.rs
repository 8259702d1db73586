//! Registry uplink: register once per connection, then keep the entry
//! alive with periodic `update` frames on the same connection. The
//! registry flips the node offline when this connection drops, so the
//! loop reconnects forever with capped backoff.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use serde_json::{json, Value};

use fabric_common::config::{
    DEFAULT_REQUEST_TIMEOUT_SECS, RECONNECT_BACKOFF_MAX_SECS, RECONNECT_BACKOFF_START_SECS,
    REGISTER_UPDATE_INTERVAL_SECS,
};
use fabric_common::protocol::Envelope;
use fabric_common::ws::{expect_kind, WsClientError, WsConnection};

use crate::config::Config;
use crate::executor::{TASK_KIND_AGENT, TASK_KIND_ECHO};

#[derive(Clone, Debug)]
pub struct Registration {
    pub registry_url: String,
    pub registry_token: String,
    pub node_id: String,
    pub node_name: String,
    pub endpoint_url: String,
    pub capabilities: HashMap<String, bool>,
    pub capability_card: Value,
    pub price_points: u64,
}

/// Advertised capability map: the configured keys, plus flags implied by
/// the agent/tool/knowledge settings.
pub fn build_capabilities(cfg: &Config) -> HashMap<String, bool> {
    let mut caps: HashMap<String, bool> = cfg
        .capabilities
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| (c.to_string(), true))
        .collect();
    caps.entry(TASK_KIND_ECHO.to_string()).or_insert(true);
    if cfg.allow_agent_tasks {
        caps.insert(TASK_KIND_AGENT.to_string(), true);
        caps.insert("web_search".to_string(), true);
        caps.insert("web_fetch".to_string(), true);
    } else {
        caps.remove(TASK_KIND_AGENT);
    }
    if cfg.knowledge_publish_dir.is_some() {
        caps.insert("knowledge.pack".to_string(), true);
    }
    caps
}

/// Informational capability card; the registry sanitizes and stores it.
pub fn build_capability_card(cfg: &Config, caps: &HashMap<String, bool>) -> Value {
    let skills: Vec<&str> = caps
        .iter()
        .filter(|(_, enabled)| **enabled)
        .map(|(k, _)| k.as_str())
        .collect();
    json!({
        "schemaVersion": "1.0",
        "summary": if cfg.node_name.is_empty() { "fabric node" } else { cfg.node_name.as_str() },
        "skills": skills,
        "pricing": {"unit": "point", "perRequest": cfg.price_points},
        "limits": {
            "maxTokens": cfg.max_tokens,
            "rateLimitPerMin": cfg.rate_limit,
            "rateLimitPerMinByNode": cfg.rate_limit_by_client,
        },
    })
}

fn register_payload(reg: &Registration) -> Value {
    json!({
        "nodeId": reg.node_id,
        "nodeName": reg.node_name,
        "endpointUrl": reg.endpoint_url,
        "capabilities": reg.capabilities,
        "capabilityCard": reg.capability_card,
        "pricePoints": reg.price_points,
        "registryToken": reg.registry_token,
    })
}

/// Run the register/update loop until cancelled.
pub async fn run_register_loop(reg: Registration) {
    let timeout = Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS);
    let mut backoff = RECONNECT_BACKOFF_START_SECS;
    loop {
        match register_session(&reg, timeout).await {
            Ok(()) => backoff = RECONNECT_BACKOFF_START_SECS,
            Err(e) => {
                warn!(
                    "registry connection failed ({}); retrying in {}s",
                    e, backoff
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
            }
        }
    }
}

async fn register_session(reg: &Registration, timeout: Duration) -> Result<(), WsClientError> {
    let mut conn = WsConnection::connect(&reg.registry_url, timeout).await?;

    let env = Envelope::with_payload("register", register_payload(reg))
        .from_node(reg.node_id.clone());
    let reply = conn.request(&env).await?;
    expect_kind(reply, "register_ok")?;
    info!(
        "registered with {} as {}",
        reg.registry_url, reg.node_id
    );

    loop {
        tokio::time::sleep(Duration::from_secs(REGISTER_UPDATE_INTERVAL_SECS)).await;
        let update = Envelope::with_payload("update", register_payload(reg))
            .from_node(reg.node_id.clone());
        let reply = conn.request(&update).await?;
        expect_kind(reply, "update_ok")?;
    }
}
