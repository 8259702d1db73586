//! Direct task intake: a WebSocket endpoint accepting `ping` and
//! `task_run` frames, guarded by the service token and both rate
//! limiters.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use actix_web::dev::ServerHandle;
use actix_web::web::{self, Data, Payload};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer};
use actix_ws::Message;
use anyhow::Context as _;
use futures::StreamExt;
use log::{debug, error, info};
use serde_json::json;
use tokio::sync::Mutex;

use fabric_common::auth::token_matches;
use fabric_common::protocol::{parse_payload, Envelope, TaskRunPayload};
use fabric_common::ratelimit::RateLimiter;
use fabric_common::task::spawn_task;

use crate::config::Config;
use crate::executor::TaskExecutor;

pub type SharedNodeServer = Arc<NodeServer>;

pub struct NodeServer {
    cfg: Config,
    executor: Arc<TaskExecutor>,
    ip_limiter: RateLimiter,
    client_limiter: RateLimiter,
    bound_addr: OnceLock<SocketAddr>,
    handle: Mutex<Option<ServerHandle>>,
}

/// Validate a task frame against the service token, the supported kinds
/// and the prompt requirement. Shared with the relay uplink, which
/// receives the same payload shape inside `relay_task` frames.
pub(crate) fn vet_task(
    required_token: &str,
    executor: &TaskExecutor,
    kind: &str,
    prompt: &str,
    service_token: &str,
) -> Result<(), String> {
    if !token_matches(required_token, service_token) {
        return Err("invalid service token".to_string());
    }
    if !executor.supported_kinds().contains(&kind) {
        return Err(format!("unsupported kind: {}", kind));
    }
    if prompt.is_empty() {
        return Err("missing prompt".to_string());
    }
    Ok(())
}

impl NodeServer {
    pub async fn start(cfg: Config, executor: Arc<TaskExecutor>) -> anyhow::Result<SharedNodeServer> {
        let server = Arc::new(Self {
            ip_limiter: RateLimiter::new(cfg.rate_limit, cfg.rate_burst),
            client_limiter: RateLimiter::new(cfg.rate_limit_by_client, cfg.rate_burst_by_client),
            cfg,
            executor,
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
        spawn_task("node-service", async move {
            if let Err(e) = http_server.await {
                error!("node service terminated: {}", e);
            }
        });

        info!("node service listening on ws://{}", addr);
        Ok(server)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        *self.bound_addr.get().expect("server started")
    }

    pub async fn stop(&self) {
        info!("stopping node service...");
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(false).await;
        }
        info!("node service stopped");
    }

    async fn handle_envelope(&self, env: &Envelope, ip_key: &str) -> Envelope {
        // every frame passes through the per-IP bucket first
        if !self.ip_limiter.allow(ip_key) {
            return env.error_reply("rate limited");
        }
        if env.kind == "ping" {
            return env.reply("pong", json!({}));
        }
        if env.kind != "task_run" {
            return env.error_reply("expected task_run");
        }

        let payload: TaskRunPayload = match parse_payload(env) {
            Ok(p) => p,
            Err(e) => return env.error_reply(e.to_string()),
        };

        if let Some(client_id) = payload.client_id.as_deref() {
            if !client_id.is_empty() && !self.client_limiter.allow(client_id) {
                return env.error_reply("rate limited");
            }
        }

        if let Err(message) = vet_task(
            &self.cfg.service_token,
            &self.executor,
            &payload.kind,
            &payload.prompt,
            &payload.service_token,
        ) {
            return env.error_reply(message);
        }

        info!(
            "task received: kind={} client={} from={}",
            payload.kind,
            payload.client_id.as_deref().unwrap_or("-"),
            ip_key,
        );

        match self.executor.run(&payload.kind, &payload.prompt).await {
            Ok(content) => env.reply("task_result", json!({ "content": content })),
            Err(e) => env.reply("task_error", json!({ "message": e.to_string() })),
        }
    }
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
    server: Data<NodeServer>,
    request: HttpRequest,
    body: Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(client_ip) = extract_client_ip(&request) else {
        return Ok(HttpResponse::Forbidden().body("unable to determine client IP"));
    };
    let (response, mut session, mut msg_stream) = actix_ws::handle(&request, body)?;

    actix_web::rt::spawn(async move {
        let ip_key = client_ip.to_string();
        while let Some(message) = msg_stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("node websocket receive error: {}", e);
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

            let reply = server.handle_envelope(&env, &ip_key).await;
            if session.text(reply.to_json()).await.is_err() {
                break;
            }
        }
        let _ = session.close(None).await;
    });

    Ok(response)
}
