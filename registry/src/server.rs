use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use actix_web::dev::ServerHandle;
use actix_web::web::{self, Data, Payload};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use actix_ws::Message;
use anyhow::Context as _;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use fabric_common::auth::token_matches;
use fabric_common::card::CapabilityCard;
use fabric_common::protocol::{
    parse_payload, truthy, AwardPayload, CancelPayload, CommitPayload, Envelope,
    KnowledgeGetPayload, KnowledgeListPayload, KnowledgeListResultPayload,
    KnowledgePublishPayload, LeaderboardPayload, ListPayload, RegisterOkPayload,
    RegisterPayload, ReportPayload, ReservePayload, ReserveOkPayload, ResolvePayload,
    SyncNode, SyncPayload,
};
use fabric_common::ratelimit::RateLimiter;
use fabric_common::task::spawn_task;

use crate::config::{Config, SNAPSHOT_INTERVAL_SECS};
use crate::state::{ListQuery, NodeUpsert, RegistryState, StateConfig};

pub type SharedRegistryServer = Arc<RegistryServer>;

/// WebSocket front end over the registry state: one connection may issue
/// many requests; replies preserve the request correlator; handler errors
/// never close the socket.
pub struct RegistryServer {
    cfg: Config,
    state: Arc<RegistryState>,
    limiter: RateLimiter,
    rate_limited: AtomicU64,
    started_at: Instant,
    bound_addr: OnceLock<SocketAddr>,
    handle: Mutex<Option<ServerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryServer {
    pub async fn start(cfg: Config) -> anyhow::Result<SharedRegistryServer> {
        let state = Arc::new(RegistryState::new(StateConfig {
            initial_points: cfg.initial_points,
            knowledge_max_bytes: cfg.knowledge_max_bytes,
            allow_mint: cfg.allow_mint,
        }));
        if let Some(path) = cfg.state_file.as_deref() {
            state.load(&PathBuf::from(path)).await;
            let (total, online) = state.counts().await;
            info!("loaded snapshot: {} nodes ({} online)", total, online);
        }

        let server = Arc::new(Self {
            limiter: RateLimiter::new(cfg.rate_limit, cfg.rate_burst),
            cfg,
            state,
            rate_limited: AtomicU64::new(0),
            started_at: Instant::now(),
            bound_addr: OnceLock::new(),
            handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        {
            let shared = Arc::clone(&server);
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(Data::from(Arc::clone(&shared)))
                    .route("/", web::get().to(ws_endpoint))
                    .route("/ws", web::get().to(ws_endpoint))
            })
            .disable_signals()
            .workers(2)
            .bind(&server.cfg.bind_address)
            .with_context(|| format!("cannot bind {}", server.cfg.bind_address))?;

            let addr = bound.addrs().first().copied().context("no bound address")?;
            server
                .bound_addr
                .set(addr)
                .expect("bound address set once");

            let http_server = bound.run();
            let handle = http_server.handle();
            *server.handle.lock().await = Some(handle);
            spawn_task("registry-server", async move {
                if let Err(e) = http_server.await {
                    error!("registry server terminated: {}", e);
                }
            });
        }

        server.spawn_background_tasks().await;
        info!("registry listening on ws://{}", server.bound_addr());
        Ok(server)
    }

    /// Address the listener actually bound (resolves `:0` for tests).
    pub fn bound_addr(&self) -> SocketAddr {
        *self.bound_addr.get().expect("server started")
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn rate_limited_total(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    async fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        // node liveness sweep at ttl/2
        if self.cfg.ttl > 0 {
            let server = Arc::clone(self);
            tasks.push(spawn_task("registry-ttl-sweep", async move {
                let period = Duration::from_secs((server.cfg.ttl / 2).max(1));
                loop {
                    tokio::time::sleep(period).await;
                    let flipped = server.state.apply_ttl(server.cfg.ttl).await;
                    if flipped > 0 {
                        debug!("ttl sweep: {} nodes went offline", flipped);
                        server.persist().await;
                    }
                }
            }));
        }

        // reservation expiry at preauth_ttl/2
        if self.cfg.preauth_ttl > 0 {
            let server = Arc::clone(self);
            tasks.push(spawn_task("registry-preauth-sweep", async move {
                let period = Duration::from_secs((server.cfg.preauth_ttl / 2).max(1));
                loop {
                    tokio::time::sleep(period).await;
                    let expired = server
                        .state
                        .expire_reservations(server.cfg.preauth_ttl)
                        .await;
                    if expired > 0 {
                        warn!("expired {} stale reservations", expired);
                        server.persist().await;
                    }
                }
            }));
        }

        // periodic snapshot, in case per-mutation saves ever fail
        if self.cfg.state_file.is_some() {
            let server = Arc::clone(self);
            tasks.push(spawn_task("registry-snapshot", async move {
                let period = Duration::from_secs(SNAPSHOT_INTERVAL_SECS);
                loop {
                    tokio::time::sleep(period).await;
                    server.persist().await;
                }
            }));
        }
    }

    /// Best-effort snapshot write. Failures are logged; the in-memory
    /// state remains authoritative.
    async fn persist(&self) {
        if let Some(path) = self.cfg.state_file.as_deref() {
            if let Err(e) = self.state.save_if_dirty(&PathBuf::from(path)).await {
                warn!("snapshot write failed: {}", e);
            }
        }
    }

    pub async fn stop(&self) {
        info!("stopping registry...");
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(path) = self.cfg.state_file.as_deref() {
            if let Err(e) = self.state.save(&PathBuf::from(path)).await {
                error!("final snapshot failed: {}", e);
            }
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(false).await;
        }
        info!("registry stopped");
    }

    fn check_token(&self, provided: &str) -> bool {
        token_matches(&self.cfg.token, provided)
    }

    fn note_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("registry_rate_limited_total").increment(1);
    }

    async fn handle_envelope(&self, env: &Envelope, bound_node: &mut Option<String>) -> Envelope {
        let result = match env.kind.as_str() {
            "ping" => Ok(env.reply("pong", json!({}))),
            "register" => self.on_register(env, bound_node, false).await,
            "update" => self.on_register(env, bound_node, true).await,
            "list" => self.on_list(env).await,
            "resolve" => self.on_resolve(env).await,
            "reserve" => self.on_reserve(env).await,
            "commit" => self.on_commit(env).await,
            "cancel" => self.on_cancel(env).await,
            "award" => self.on_award(env).await,
            "report" => self.on_report(env).await,
            "leaderboard" => self.on_leaderboard(env).await,
            "sync" => self.on_sync(env).await,
            "knowledge_publish" => self.on_knowledge_publish(env).await,
            "knowledge_list" => self.on_knowledge_list(env).await,
            "knowledge_get" => self.on_knowledge_get(env).await,
            other => Err(format!("unknown type: {}", other)),
        };
        result.unwrap_or_else(|message| env.error_reply(message))
    }

    async fn on_register(
        &self,
        env: &Envelope,
        bound_node: &mut Option<String>,
        is_update: bool,
    ) -> Result<Envelope, String> {
        let payload: RegisterPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        let node_id = payload
            .node_id
            .clone()
            .or_else(|| env.from_node.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or("missing nodeId")?;

        if is_update && bound_node.as_deref() != Some(node_id.as_str()) {
            return Err("connection not bound to node".to_string());
        }

        let capabilities = payload
            .capabilities
            .iter()
            .map(|(k, v)| (k.clone(), truthy(v)))
            .collect();
        let created = self
            .state
            .upsert_node(NodeUpsert {
                node_id: node_id.clone(),
                node_name: payload.node_name.clone(),
                endpoint_url: payload.endpoint_url.clone(),
                capabilities,
                capability_card: CapabilityCard::sanitize(&payload.capability_card),
                price_points: payload.price_points,
            })
            .await;
        if created {
            info!("new node registered: {}", node_id);
        }
        self.persist().await;

        if !is_update {
            *bound_node = Some(node_id.clone());
        }
        let ok_kind = if is_update { "update_ok" } else { "register_ok" };
        Ok(env.reply(
            ok_kind,
            serde_json::to_value(RegisterOkPayload { node_id }).expect("serialize"),
        ))
    }

    async fn on_list(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: ListPayload = parse_payload(env).map_err(|e| e.to_string())?;
        let page = self
            .state
            .list_page(ListQuery {
                online_only: payload.online_only,
                require_capabilities: payload.require_capabilities,
                page: payload.page,
                page_size: payload.page_size,
            })
            .await;
        Ok(env.reply("list_result", serde_json::to_value(page).expect("serialize")))
    }

    async fn on_resolve(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: ResolvePayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.node_id.is_empty() {
            return Err("missing nodeId".to_string());
        }
        let resolved = self
            .state
            .resolve(&payload.node_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(env.reply("resolve_ok", serde_json::to_value(resolved).expect("serialize")))
    }

    async fn on_reserve(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: ReservePayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.node_id.is_empty() {
            return Err("missing nodeId".to_string());
        }
        if payload.payer_node.is_empty() {
            return Err("missing payerNode".to_string());
        }
        let reservation_id = self
            .state
            .reserve(&payload.payer_node, &payload.node_id, payload.points)
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply(
            "reserve_ok",
            serde_json::to_value(ReserveOkPayload { reservation_id }).expect("serialize"),
        ))
    }

    async fn on_commit(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: CommitPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.reservation_id.is_empty() {
            return Err("missing reservationId".to_string());
        }
        self.state
            .commit(&payload.reservation_id)
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply("commit_ok", json!({})))
    }

    async fn on_cancel(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: CancelPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.reservation_id.is_empty() {
            return Err("missing reservationId".to_string());
        }
        self.state
            .cancel(&payload.reservation_id)
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply("cancel_ok", json!({})))
    }

    async fn on_award(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: AwardPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.node_id.is_empty() {
            return Err("missing nodeId".to_string());
        }
        self.state
            .award(
                &payload.node_id,
                payload.points,
                payload.payer_node.as_deref(),
            )
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply("award_ok", json!({})))
    }

    async fn on_report(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: ReportPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        if payload.node_id.is_empty() {
            return Err("missing nodeId".to_string());
        }
        self.state
            .report(&payload.node_id, payload.ok, payload.latency_ms)
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply("report_ok", json!({})))
    }

    async fn on_leaderboard(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: LeaderboardPayload = parse_payload(env).map_err(|e| e.to_string())?;
        let board = self
            .state
            .leaderboard(payload.sort_by.as_deref(), payload.limit)
            .await;
        Ok(env.reply(
            "leaderboard_result",
            serde_json::to_value(board).expect("serialize"),
        ))
    }

    async fn on_sync(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: SyncPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        let nodes: Vec<SyncNode> = payload
            .nodes
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        let merged = self.state.sync_merge(nodes).await;
        self.persist().await;
        Ok(env.reply("sync_ok", json!({ "merged": merged })))
    }

    async fn on_knowledge_publish(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: KnowledgePublishPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if !self.check_token(&payload.registry_token) {
            return Err("invalid registry token".to_string());
        }
        let ok = self
            .state
            .knowledge_publish(&payload)
            .await
            .map_err(|e| e.to_string())?;
        self.persist().await;
        Ok(env.reply(
            "knowledge_publish_ok",
            serde_json::to_value(ok).expect("serialize"),
        ))
    }

    async fn on_knowledge_list(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: KnowledgeListPayload = parse_payload(env).map_err(|e| e.to_string())?;
        let packs = self
            .state
            .knowledge_list(
                payload.kind.as_deref(),
                payload.tag.as_deref(),
                payload.owner_node.as_deref(),
                payload.limit,
            )
            .await;
        Ok(env.reply(
            "knowledge_list_result",
            serde_json::to_value(KnowledgeListResultPayload { packs }).expect("serialize"),
        ))
    }

    async fn on_knowledge_get(&self, env: &Envelope) -> Result<Envelope, String> {
        let payload: KnowledgeGetPayload = parse_payload(env).map_err(|e| e.to_string())?;
        if payload.id.is_empty() {
            return Err("missing id".to_string());
        }
        let pack = self
            .state
            .knowledge_get(&payload.id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(env.reply(
            "knowledge_get_result",
            serde_json::to_value(pack).expect("serialize"),
        ))
    }
}

/// Extract the client IP, preferring X-Forwarded-For for deployments
/// behind a reverse proxy.
fn extract_client_ip(req: &HttpRequest) -> Option<IpAddr> {
    if let Some(forwarded) = req.headers().get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first) = forwarded_str.split(',').next() {
                if let Ok(ip) = IpAddr::from_str(first.trim()) {
                    return Some(ip);
                }
            }
        }
    }
    req.peer_addr().map(|addr| addr.ip())
}

async fn ws_endpoint(
    server: Data<RegistryServer>,
    request: HttpRequest,
    body: Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(client_ip) = extract_client_ip(&request) else {
        return Ok(HttpResponse::Forbidden().body("unable to determine client IP"));
    };
    let (response, mut session, mut msg_stream) = actix_ws::handle(&request, body)?;

    actix_web::rt::spawn(async move {
        let ip_key = client_ip.to_string();
        let mut bound_node: Option<String> = None;

        while let Some(message) = msg_stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("registry websocket receive error: {}", e);
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        let mut reply = Envelope::new("error");
                        reply.payload = json!({"message": "bad json: not utf-8"});
                        if session.text(reply.to_json()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                Message::Ping(data) => {
                    if session.pong(&data).await.is_err() {
                        break;
                    }
                    continue;
                }
                Message::Close(_) => break,
                _ => continue,
            };

            let env = match Envelope::from_json(&text) {
                Ok(env) => env,
                Err(e) => {
                    let mut reply = Envelope::new("error");
                    reply.payload = json!({"message": format!("{}", e)});
                    if session.text(reply.to_json()).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if !server.limiter.allow(&ip_key) {
                server.note_rate_limited();
                if session.text(env.error_reply("rate limited").to_json()).await.is_err() {
                    break;
                }
                continue;
            }

            let reply = server.handle_envelope(&env, &mut bound_node).await;
            if session.text(reply.to_json()).await.is_err() {
                break;
            }
        }

        // register connections own their node's liveness
        if let Some(node_id) = bound_node {
            server.state.set_offline(&node_id).await;
            server.persist().await;
            debug!("node {} went offline (connection closed)", node_id);
        }
        let _ = session.close(None).await;
    });

    Ok(response)
}
