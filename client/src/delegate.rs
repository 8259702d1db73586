//! End-to-end delegation: list capable providers, pick one, hold the
//! points, run the task through the relay or a direct endpoint, then
//! settle the reservation and report the outcome.

use std::time::Instant;

use log::{debug, warn};
use serde_json::json;
use thiserror::Error;

use fabric_common::protocol::{
    parse_payload, Envelope, NodeSummary, RelayResponsePayload, TaskResultPayload,
};
use fabric_common::time::TimestampMillis;
use fabric_common::ws::{WsClientError, WsConnection};

use crate::config::DelegationConfig;
use crate::picker::pick_node;
use crate::registry::{list_capable_nodes, RegistryClient};

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("no eligible nodes found")]
    NoEligibleNodes,
    #[error("node not found or offline: {0}")]
    NodeUnavailable(String),
    #[error("preauth requires registryToken and clientId")]
    PreauthUnavailable,
    #[error("relay_only enabled but relay_url is not configured")]
    RelayOnlyWithoutRelay,
    #[error("endpoint not available")]
    NoEndpoint,
    #[error("task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Client(#[from] WsClientError),
}

#[derive(Clone, Debug)]
pub struct DelegationRequest {
    pub kind: String,
    pub prompt: String,
    /// Capability to filter providers by; defaults to the task kind.
    pub require_capability: Option<String>,
    /// Pin a specific provider instead of scoring candidates.
    pub to_node: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DelegationOutcome {
    pub node: NodeSummary,
    pub content: String,
    pub latency_ms: TimestampMillis,
}

/// Run one task against the best available provider.
///
/// Reconciliation (commit/cancel + report) is best-effort and runs in a
/// spawned task, so a caller that is itself cancelled after the call
/// cannot strand the reservation.
pub async fn delegate_task(
    cfg: &DelegationConfig,
    request: DelegationRequest,
) -> Result<DelegationOutcome, DelegationError> {
    if cfg.relay_only && cfg.relay_url.is_empty() {
        return Err(DelegationError::RelayOnlyWithoutRelay);
    }
    let preauth_available = !cfg.registry_token.is_empty() && !cfg.client_id.is_empty();
    if cfg.preauth_enabled && cfg.preauth_required && !preauth_available {
        return Err(DelegationError::PreauthUnavailable);
    }

    let registry = RegistryClient::new(
        cfg.registry_url.clone(),
        cfg.registry_token.clone(),
        cfg.request_timeout,
    );

    let capability = request
        .require_capability
        .clone()
        .unwrap_or_else(|| request.kind.clone());
    let nodes = list_capable_nodes(&registry, &capability).await?;

    let node = match request.to_node.as_deref() {
        Some(target) => nodes
            .iter()
            .find(|n| n.node_id == target)
            .ok_or_else(|| DelegationError::NodeUnavailable(target.to_string()))?,
        None => pick_node(&nodes, cfg.max_price_points)?,
    }
    .clone();
    debug!("delegating {} to node {}", request.kind, node.node_id);

    let mut guard = if cfg.preauth_enabled && preauth_available {
        let points = node.price_points.max(1);
        let reservation_id = registry.reserve(&cfg.client_id, &node.node_id, points).await?;
        ReservationGuard::new(registry.clone(), reservation_id)
    } else {
        ReservationGuard::empty()
    };

    let started = Instant::now();
    let result = call_provider(cfg, &registry, &node, &request).await;
    let latency_ms = started.elapsed().as_millis() as TimestampMillis;
    // from here on settlement is owned by the reconcile task
    let reservation = guard.defuse();

    // settle in a spawned task: a dropped caller future must still
    // cancel/commit the reservation
    let settle = tokio::spawn(reconcile(
        registry,
        !cfg.registry_token.is_empty(),
        node.node_id.clone(),
        node.price_points.max(1),
        cfg.client_id.clone(),
        reservation,
        result.is_ok(),
        latency_ms,
    ));
    let _ = settle.await;

    let content = result?;
    Ok(DelegationOutcome {
        node,
        content,
        latency_ms,
    })
}

async fn call_provider(
    cfg: &DelegationConfig,
    registry: &RegistryClient,
    node: &NodeSummary,
    request: &DelegationRequest,
) -> Result<String, DelegationError> {
    if !cfg.relay_url.is_empty() {
        match call_via_relay(cfg, &node.node_id, request).await {
            Ok(content) => return Ok(content),
            Err(e) if cfg.relay_only => return Err(e),
            Err(e) => warn!("relay call failed ({}); trying direct endpoint", e),
        }
    }

    let resolved = registry.resolve(&node.node_id).await?;
    if resolved.endpoint_url.is_empty() {
        return Err(DelegationError::NoEndpoint);
    }
    call_node(cfg, &resolved.endpoint_url, request).await
}

/// Direct `task_run` against a node endpoint.
async fn call_node(
    cfg: &DelegationConfig,
    endpoint_url: &str,
    request: &DelegationRequest,
) -> Result<String, DelegationError> {
    let mut conn = WsConnection::connect(endpoint_url, cfg.request_timeout).await?;
    let env = Envelope::with_payload(
        "task_run",
        json!({
            "kind": request.kind,
            "prompt": request.prompt,
            "serviceToken": cfg.service_token,
            "clientId": if cfg.client_id.is_empty() { None } else { Some(cfg.client_id.as_str()) },
        }),
    );
    let reply = conn.request_with_timeout(&env, cfg.task_timeout).await;
    conn.close().await;

    let reply = reply?;
    match reply.kind.as_str() {
        "task_result" => {
            let payload: TaskResultPayload = parse_payload(&reply).map_err(WsClientError::from)?;
            Ok(payload.content)
        }
        "task_error" | "error" => Err(DelegationError::Task(error_message(&reply))),
        other => Err(DelegationError::Client(WsClientError::UnexpectedType(
            other.to_string(),
        ))),
    }
}

/// `relay_request` through the relay; the reply is the node's result
/// re-wrapped under the original correlator.
async fn call_via_relay(
    cfg: &DelegationConfig,
    node_id: &str,
    request: &DelegationRequest,
) -> Result<String, DelegationError> {
    let mut conn = WsConnection::connect(&cfg.relay_url, cfg.request_timeout).await?;
    let env = Envelope::with_payload(
        "relay_request",
        json!({
            "nodeId": node_id,
            "kind": request.kind,
            "prompt": request.prompt,
            "serviceToken": cfg.service_token,
            "clientId": if cfg.client_id.is_empty() { None } else { Some(cfg.client_id.as_str()) },
            "relayToken": cfg.relay_token,
        }),
    );
    let reply = conn.request_with_timeout(&env, cfg.task_timeout).await;
    conn.close().await;

    let reply = reply?;
    match reply.kind.as_str() {
        "relay_response" => {
            let payload: RelayResponsePayload =
                parse_payload(&reply).map_err(WsClientError::from)?;
            if payload.ok {
                Ok(payload.content.unwrap_or_default())
            } else {
                Err(DelegationError::Task(
                    payload
                        .message
                        .unwrap_or_else(|| "relay task failed".to_string()),
                ))
            }
        }
        "error" => Err(DelegationError::Task(error_message(&reply))),
        other => Err(DelegationError::Client(WsClientError::UnexpectedType(
            other.to_string(),
        ))),
    }
}

/// Holds a reservation id across the provider call. If the enclosing
/// future is dropped before settlement (caller cancelled mid-call), the
/// guard spawns a best-effort cancel so the payer's points are not left
/// stranded until the registry's preauth TTL.
struct ReservationGuard {
    registry: Option<RegistryClient>,
    reservation_id: String,
}

impl ReservationGuard {
    fn new(registry: RegistryClient, reservation_id: String) -> Self {
        Self {
            registry: Some(registry),
            reservation_id,
        }
    }

    fn empty() -> Self {
        Self {
            registry: None,
            reservation_id: String::new(),
        }
    }

    /// Take over settlement; the guard will no longer cancel on drop.
    fn defuse(&mut self) -> Option<String> {
        self.registry.take()?;
        Some(std::mem::take(&mut self.reservation_id))
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            let reservation_id = std::mem::take(&mut self.reservation_id);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = registry.cancel(&reservation_id).await {
                        warn!("cancel of abandoned reservation failed: {}", e);
                    }
                });
            }
        }
    }
}

fn error_message(reply: &Envelope) -> String {
    reply
        .payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("task failed")
        .to_string()
}

/// Best-effort settlement. Never masks the primary outcome: every
/// failure here is logged and swallowed.
#[allow(clippy::too_many_arguments)]
async fn reconcile(
    registry: RegistryClient,
    report_enabled: bool,
    node_id: String,
    price_points: u64,
    payer: String,
    reservation: Option<String>,
    ok: bool,
    latency_ms: TimestampMillis,
) {
    match (&reservation, ok) {
        (Some(rid), true) => {
            if let Err(e) = registry.commit(rid).await {
                warn!("commit failed ({}); falling back to award", e);
                if let Err(e) = registry.award(&node_id, price_points, Some(&payer)).await {
                    warn!("award fallback failed: {}", e);
                }
            }
        }
        (Some(rid), false) => {
            if let Err(e) = registry.cancel(rid).await {
                warn!("cancel failed: {}", e);
            }
        }
        (None, _) => {}
    }
    if report_enabled {
        if let Err(e) = registry.report(&node_id, ok, latency_ms).await {
            warn!("report failed: {}", e);
        }
    }
}
