//! The relay is pure transport: it forwards `relay_request` frames from
//! clients to nodes and `relay_result` frames back, rewriting correlators
//! so node and client never see each other's ids. It never interprets or
//! logs prompt content and never contacts the registry.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::web::{self, Data, Payload};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use actix_ws::{Message, Session};
use anyhow::Context as _;
use futures::StreamExt;
use log::{debug, error, info};
use serde_json::json;
use tokio::sync::Mutex;

use fabric_common::auth::token_matches;
use fabric_common::protocol::{
    new_id, parse_payload, Envelope, RelayHelloOkPayload, RelayHelloPayload,
    RelayRequestPayload, RelayTaskPayload,
};
use fabric_common::ratelimit::RateLimiter;
use fabric_common::task::spawn_task;

use crate::config::Config;
use crate::table::{PendingRequest, RelayTable};

pub type SharedRelayServer = Arc<RelayServer>;

pub struct RelayServer {
    cfg: Config,
    table: Mutex<RelayTable<Session>>,
    ip_limiter: RateLimiter,
    client_limiter: RateLimiter,
    next_conn_id: AtomicU64,
    bound_addr: OnceLock<SocketAddr>,
    handle: Mutex<Option<ServerHandle>>,
}

impl RelayServer {
    pub async fn start(cfg: Config) -> anyhow::Result<SharedRelayServer> {
        let server = Arc::new(Self {
            ip_limiter: RateLimiter::new(cfg.rate_limit, cfg.rate_burst),
            client_limiter: RateLimiter::new(cfg.rate_limit_by_client, cfg.rate_burst_by_client),
            cfg,
            table: Mutex::new(RelayTable::new()),
            next_conn_id: AtomicU64::new(1),
            bound_addr: OnceLock::new(),
            handle: Mutex::new(None),
        });

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
        server.bound_addr.set(addr).expect("bound address set once");

        let http_server = bound.run();
        *server.handle.lock().await = Some(http_server.handle());
        spawn_task("relay-server", async move {
            if let Err(e) = http_server.await {
                error!("relay server terminated: {}", e);
            }
        });

        info!("relay listening on ws://{}", addr);
        Ok(server)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        *self.bound_addr.get().expect("server started")
    }

    pub async fn stop(&self) {
        info!("stopping relay...");
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(false).await;
        }
        info!("relay stopped");
    }

    fn check_token(&self, provided: &str) -> bool {
        token_matches(&self.cfg.relay_token, provided)
    }

    /// Opportunistic pending sweep, run on every inbound frame. Waiting
    /// clients receive a synthetic timeout response; the node is not
    /// notified (the pending table is the relay's truth).
    async fn sweep_pending(&self) {
        let expired = {
            let mut table = self.table.lock().await;
            table.sweep_expired(Duration::from_secs(self.cfg.pending_ttl))
        };
        for entry in expired {
            debug!(
                "pending request {} timed out; notifying client",
                entry.client_request_id
            );
            send_timeout_response(entry).await;
        }
    }

    async fn handle_envelope(
        &self,
        env: Envelope,
        conn_id: u64,
        session: &Session,
        node_binding: &mut Option<String>,
    ) -> Option<Envelope> {
        match env.kind.as_str() {
            "ping" => Some(env.reply("pong", json!({}))),
            "relay_hello" => {
                let payload: RelayHelloPayload = match parse_payload(&env) {
                    Ok(p) => p,
                    Err(e) => return Some(env.error_reply(e.to_string())),
                };
                if !self.check_token(&payload.relay_token) {
                    return Some(env.error_reply("invalid relay token"));
                }
                if payload.node_id.is_empty() {
                    return Some(env.error_reply("missing nodeId"));
                }
                self.table.lock().await.register_node(
                    &payload.node_id,
                    conn_id,
                    session.clone(),
                );
                *node_binding = Some(payload.node_id.clone());
                info!("node {} connected to relay", payload.node_id);
                Some(env.reply(
                    "relay_hello_ok",
                    serde_json::to_value(RelayHelloOkPayload {
                        node_id: payload.node_id,
                    })
                    .expect("serialize"),
                ))
            }
            "relay_request" => {
                let payload: RelayRequestPayload = match parse_payload(&env) {
                    Ok(p) => p,
                    Err(e) => return Some(env.error_reply(e.to_string())),
                };
                if !self.check_token(&payload.relay_token) {
                    return Some(env.error_reply("invalid relay token"));
                }
                if let Some(client_id) = payload.client_id.as_deref() {
                    if !self.client_limiter.allow(client_id) {
                        return Some(env.error_reply("rate limited"));
                    }
                }
                if payload.node_id.is_empty() {
                    return Some(env.error_reply("missing nodeId"));
                }

                let Some(node_session) =
                    self.table.lock().await.node_session(&payload.node_id)
                else {
                    return Some(env.error_reply("node offline"));
                };

                let internal_id = new_id();
                {
                    let mut table = self.table.lock().await;
                    table.insert_pending(&internal_id, conn_id, session.clone(), &env.id);
                }
                let mut forward = Envelope::with_payload(
                    "relay_task",
                    serde_json::to_value(RelayTaskPayload {
                        node_id: payload.node_id.clone(),
                        kind: payload.kind,
                        prompt: payload.prompt,
                        service_token: payload.service_token,
                        client_id: payload.client_id,
                    })
                    .expect("serialize"),
                );
                forward.id = internal_id.clone();

                let mut node_session = node_session;
                if node_session.text(forward.to_json()).await.is_err() {
                    // uplink is gone: unregister and fail the request now
                    let mut table = self.table.lock().await;
                    table.remove_node(&payload.node_id);
                    table.pop_pending(&internal_id);
                    return Some(env.error_reply("node offline"));
                }
                None
            }
            "relay_result" => {
                let entry = self.table.lock().await.pop_pending(&env.id);
                match entry {
                    Some(entry) => {
                        let mut response =
                            Envelope::with_payload("relay_response", env.payload.clone());
                        response.id = entry.client_request_id.clone();
                        let mut client = entry.session;
                        if client.text(response.to_json()).await.is_err() {
                            debug!("client for {} is gone; result dropped", response.id);
                        }
                    }
                    // result for an expired or unknown pending entry
                    None => debug!("discarding relay_result with unknown id {}", env.id),
                }
                None
            }
            other => Some(env.error_reply(format!("unknown type: {}", other))),
        }
    }
}

async fn send_timeout_response(entry: PendingRequest<Session>) {
    let mut response = Envelope::with_payload(
        "relay_response",
        json!({"ok": false, "message": "timeout"}),
    );
    response.id = entry.client_request_id;
    let mut session = entry.session;
    let _ = session.text(response.to_json()).await;
}

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
    server: Data<RelayServer>,
    request: HttpRequest,
    body: Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(client_ip) = extract_client_ip(&request) else {
        return Ok(HttpResponse::Forbidden().body("unable to determine client IP"));
    };
    let (response, mut session, mut msg_stream) = actix_ws::handle(&request, body)?;
    let conn_id = server.next_conn_id.fetch_add(1, Ordering::Relaxed);

    actix_web::rt::spawn(async move {
        let ip_key = client_ip.to_string();
        let mut node_binding: Option<String> = None;

        while let Some(message) = msg_stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("relay websocket receive error: {}", e);
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
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

            server.sweep_pending().await;

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

            if !server.ip_limiter.allow(&ip_key) {
                if session.text(env.error_reply("rate limited").to_json()).await.is_err() {
                    break;
                }
                continue;
            }

            let reply = server
                .handle_envelope(env, conn_id, &session, &mut node_binding)
                .await;
            if let Some(reply) = reply {
                if session.text(reply.to_json()).await.is_err() {
                    break;
                }
            }
        }

        // teardown: free the node mapping (if we were a node) and drop
        // this connection's waiting requests (if we were a client); node
        // pendings are left for the TTL sweep so clients still get a
        // timeout response
        {
            let mut table = server.table.lock().await;
            if let Some(node_id) = node_binding {
                if table.remove_node_if_owned(&node_id, conn_id) {
                    info!("node {} disconnected from relay", node_id);
                }
            }
            let dropped = table.drop_client(conn_id);
            if dropped > 0 {
                debug!("dropped {} pending requests for closed client", dropped);
            }
        }
        let _ = session.close(None).await;
    });

    Ok(response)
}
