//! Thin typed client over the registry protocol. Each call opens a fresh
//! connection, sends one request and waits for its correlated reply under
//! a read deadline; `error` envelopes surface as typed errors.

use std::time::Duration;

use log::trace;
use serde_json::json;

use fabric_common::knowledge::{KnowledgePack, PackMeta};
use fabric_common::protocol::{
    parse_payload, Envelope, KnowledgeListResultPayload, KnowledgePublishOkPayload,
    LeaderboardResultPayload, ListResultPayload, NodeSummary, RegisterOkPayload,
    ReserveOkPayload, ResolveOkPayload,
};
use fabric_common::time::TimestampMillis;
use fabric_common::ws::{expect_kind, request_once, WsClientError};

#[derive(Clone, Debug)]
pub struct RegistryClient {
    url: String,
    token: String,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            timeout,
        }
    }

    async fn call(&self, env: Envelope, ok_kind: &str) -> Result<Envelope, WsClientError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("registry call: {}", env.kind);
        }
        let reply = request_once(&self.url, &env, self.timeout).await?;
        expect_kind(reply, ok_kind)
    }

    pub async fn ping(&self) -> Result<(), WsClientError> {
        self.call(Envelope::new("ping"), "pong").await.map(|_| ())
    }

    pub async fn list_nodes(
        &self,
        require_capabilities: &[String],
        online_only: bool,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<ListResultPayload, WsClientError> {
        let env = Envelope::with_payload(
            "list",
            json!({
                "onlineOnly": online_only,
                "requireCapabilities": require_capabilities,
                "page": page,
                "pageSize": page_size,
                "registryToken": self.token,
            }),
        );
        let reply = self.call(env, "list_result").await?;
        Ok(parse_payload(&reply)?)
    }

    /// Register a node entry. Used by tests and tooling; long-running
    /// nodes keep a persistent register connection instead.
    pub async fn register_node(
        &self,
        node_id: &str,
        endpoint_url: &str,
        capabilities: &[&str],
        price_points: u64,
    ) -> Result<String, WsClientError> {
        let caps: serde_json::Map<String, serde_json::Value> = capabilities
            .iter()
            .map(|c| (c.to_string(), serde_json::Value::Bool(true)))
            .collect();
        let env = Envelope::with_payload(
            "register",
            json!({
                "nodeId": node_id,
                "endpointUrl": endpoint_url,
                "capabilities": caps,
                "pricePoints": price_points,
                "registryToken": self.token,
            }),
        );
        let reply = self.call(env, "register_ok").await?;
        let payload: RegisterOkPayload = parse_payload(&reply)?;
        Ok(payload.node_id)
    }

    pub async fn resolve(&self, node_id: &str) -> Result<ResolveOkPayload, WsClientError> {
        let env = Envelope::with_payload(
            "resolve",
            json!({ "nodeId": node_id, "registryToken": self.token }),
        );
        let reply = self.call(env, "resolve_ok").await?;
        Ok(parse_payload(&reply)?)
    }

    pub async fn reserve(
        &self,
        payer_node: &str,
        provider_node: &str,
        points: u64,
    ) -> Result<String, WsClientError> {
        let env = Envelope::with_payload(
            "reserve",
            json!({
                "nodeId": provider_node,
                "payerNode": payer_node,
                "points": points,
                "registryToken": self.token,
            }),
        );
        let reply = self.call(env, "reserve_ok").await?;
        let payload: ReserveOkPayload = parse_payload(&reply)?;
        Ok(payload.reservation_id)
    }

    pub async fn commit(&self, reservation_id: &str) -> Result<(), WsClientError> {
        let env = Envelope::with_payload(
            "commit",
            json!({ "reservationId": reservation_id, "registryToken": self.token }),
        );
        self.call(env, "commit_ok").await.map(|_| ())
    }

    pub async fn cancel(&self, reservation_id: &str) -> Result<(), WsClientError> {
        let env = Envelope::with_payload(
            "cancel",
            json!({ "reservationId": reservation_id, "registryToken": self.token }),
        );
        self.call(env, "cancel_ok").await.map(|_| ())
    }

    pub async fn award(
        &self,
        provider_node: &str,
        points: u64,
        payer_node: Option<&str>,
    ) -> Result<(), WsClientError> {
        let env = Envelope::with_payload(
            "award",
            json!({
                "nodeId": provider_node,
                "points": points,
                "payerNode": payer_node,
                "registryToken": self.token,
            }),
        );
        self.call(env, "award_ok").await.map(|_| ())
    }

    pub async fn report(
        &self,
        node_id: &str,
        ok: bool,
        latency_ms: TimestampMillis,
    ) -> Result<(), WsClientError> {
        let env = Envelope::with_payload(
            "report",
            json!({
                "nodeId": node_id,
                "ok": ok,
                "latencyMs": latency_ms,
                "registryToken": self.token,
            }),
        );
        self.call(env, "report_ok").await.map(|_| ())
    }

    pub async fn leaderboard(
        &self,
        sort_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<LeaderboardResultPayload, WsClientError> {
        let env = Envelope::with_payload(
            "leaderboard",
            json!({ "sortBy": sort_by, "limit": limit }),
        );
        let reply = self.call(env, "leaderboard_result").await?;
        Ok(parse_payload(&reply)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn knowledge_publish(
        &self,
        id: Option<&str>,
        name: &str,
        kind: &str,
        content: &str,
        summary: &str,
        tags: &[String],
        version: &str,
        owner_node: &str,
        allow_update: bool,
    ) -> Result<KnowledgePublishOkPayload, WsClientError> {
        let env = Envelope::with_payload(
            "knowledge_publish",
            json!({
                "id": id,
                "name": name,
                "kind": kind,
                "content": content,
                "summary": summary,
                "tags": tags,
                "version": version,
                "ownerNode": owner_node,
                "allowUpdate": allow_update,
                "registryToken": self.token,
            }),
        );
        let reply = self.call(env, "knowledge_publish_ok").await?;
        Ok(parse_payload(&reply)?)
    }

    pub async fn knowledge_list(
        &self,
        kind: Option<&str>,
        tag: Option<&str>,
        owner_node: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<PackMeta>, WsClientError> {
        let env = Envelope::with_payload(
            "knowledge_list",
            json!({
                "kind": kind,
                "tag": tag,
                "ownerNode": owner_node,
                "limit": limit,
            }),
        );
        let reply = self.call(env, "knowledge_list_result").await?;
        let payload: KnowledgeListResultPayload = parse_payload(&reply)?;
        Ok(payload.packs)
    }

    pub async fn knowledge_get(&self, id: &str) -> Result<KnowledgePack, WsClientError> {
        let env = Envelope::with_payload("knowledge_get", json!({ "id": id }));
        let reply = self.call(env, "knowledge_get_result").await?;
        Ok(parse_payload(&reply)?)
    }
}

/// Convenience used by the delegation pipeline: all nodes matching one
/// capability, online only.
pub async fn list_capable_nodes(
    client: &RegistryClient,
    capability: &str,
) -> Result<Vec<NodeSummary>, WsClientError> {
    let result = client
        .list_nodes(&[capability.to_string()], true, None, None)
        .await?;
    Ok(result.nodes)
}
