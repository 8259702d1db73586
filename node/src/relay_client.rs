//! Persistent uplink from a node to a relay. After the hello handshake
//! the connection only carries `relay_task` frames inward and
//! `relay_result` frames outward. In-flight tasks are never retried
//! across reconnects; the relay times them out and notifies the client.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;

use fabric_common::config::{
    DEFAULT_REQUEST_TIMEOUT_SECS, RECONNECT_BACKOFF_MAX_SECS, RECONNECT_BACKOFF_START_SECS,
};
use fabric_common::protocol::{parse_payload, Envelope, RelayTaskPayload};
use fabric_common::ratelimit::RateLimiter;
use fabric_common::ws::{expect_kind, WsClientError, WsConnection};

use crate::executor::TaskExecutor;
use crate::service::vet_task;

#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    pub relay_url: String,
    pub node_id: String,
    pub relay_token: String,
    pub service_token: String,
    pub rate_limit: u32,
    pub rate_burst: u32,
    pub rate_limit_by_client: u32,
    pub rate_burst_by_client: u32,
}

pub struct RelayNodeClient {
    cfg: RelayClientConfig,
    executor: Arc<TaskExecutor>,
    limiter: RateLimiter,
    client_limiter: RateLimiter,
}

impl RelayNodeClient {
    pub fn new(cfg: RelayClientConfig, executor: Arc<TaskExecutor>) -> Self {
        Self {
            limiter: RateLimiter::new(cfg.rate_limit, cfg.rate_burst),
            client_limiter: RateLimiter::new(cfg.rate_limit_by_client, cfg.rate_burst_by_client),
            cfg,
            executor,
        }
    }

    /// Reconnect forever with capped exponential backoff.
    pub async fn run_forever(&self) {
        let mut backoff = RECONNECT_BACKOFF_START_SECS;
        loop {
            match self.run_once().await {
                Ok(()) => backoff = RECONNECT_BACKOFF_START_SECS,
                Err(e) => {
                    warn!(
                        "relay client: connection failed ({}); retrying in {}s",
                        e, backoff
                    );
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
                }
            }
        }
    }

    async fn run_once(&self) -> Result<(), WsClientError> {
        let timeout = Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS);
        let mut conn = WsConnection::connect(&self.cfg.relay_url, timeout).await?;

        let hello = Envelope::with_payload(
            "relay_hello",
            json!({
                "nodeId": self.cfg.node_id,
                "relayToken": self.cfg.relay_token,
            }),
        );
        let reply = conn.request(&hello).await?;
        expect_kind(reply, "relay_hello_ok")?;
        info!("relay uplink established ({})", self.cfg.relay_url);

        loop {
            // tasks arrive unsolicited; wait without a read deadline by
            // polling in long slices
            let env = match conn.recv_with_timeout(Duration::from_secs(3600)).await {
                Ok(env) => env,
                Err(WsClientError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            };

            match env.kind.as_str() {
                "ping" => {
                    let pong = env.reply("pong", json!({}));
                    conn.send(&pong).await?;
                }
                "relay_task" => {
                    let result = self.handle_task(&env).await;
                    conn.send(&result).await?;
                }
                other => {
                    let error = env.error_reply(format!("expected relay_task, got {}", other));
                    conn.send(&error).await?;
                }
            }
        }
    }

    async fn handle_task(&self, env: &Envelope) -> Envelope {
        let payload: RelayTaskPayload = match parse_payload(env) {
            Ok(p) => p,
            Err(e) => return self.result_err(env, e.to_string()),
        };

        if !self.limiter.allow("relay") {
            return self.result_err(env, "rate limited");
        }
        if let Some(client_id) = payload.client_id.as_deref() {
            if !client_id.is_empty() && !self.client_limiter.allow(client_id) {
                return self.result_err(env, "rate limited");
            }
        }

        if let Err(message) = vet_task(
            &self.cfg.service_token,
            &self.executor,
            &payload.kind,
            &payload.prompt,
            &payload.service_token,
        ) {
            return self.result_err(env, message);
        }

        match self.executor.run(&payload.kind, &payload.prompt).await {
            Ok(content) => env.reply(
                "relay_result",
                json!({
                    "ok": true,
                    "content": content,
                    "nodeId": self.cfg.node_id,
                }),
            ),
            Err(e) => self.result_err(env, e.to_string()),
        }
    }

    fn result_err(&self, env: &Envelope, message: impl Into<String>) -> Envelope {
        env.reply(
            "relay_result",
            json!({
                "ok": false,
                "message": message.into(),
                "nodeId": self.cfg.node_id,
            }),
        )
    }
}
