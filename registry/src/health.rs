//! Optional plain-HTTP listener exposing `GET /health` and `GET /metrics`
//! on a separate port, so operators can probe the registry without
//! speaking the WebSocket protocol. The connection is closed after each
//! response.

use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::http::header;
use actix_web::web::{self, Data};
use actix_web::{App, HttpResponse, HttpServer};
use anyhow::Context as _;
use log::{error, info};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use fabric_common::task::spawn_task;

use crate::server::SharedRegistryServer;

pub struct HealthServer {
    handle: ServerHandle,
    bound_addr: std::net::SocketAddr,
}

struct HealthContext {
    registry: SharedRegistryServer,
    prometheus: Option<PrometheusHandle>,
}

impl HealthServer {
    pub async fn start(
        bind_address: &str,
        registry: SharedRegistryServer,
        prometheus: Option<PrometheusHandle>,
    ) -> anyhow::Result<Self> {
        let context = Arc::new(HealthContext {
            registry,
            prometheus,
        });
        let bound = HttpServer::new(move || {
            App::new()
                .app_data(Data::from(Arc::clone(&context)))
                .route("/health", web::get().to(health))
                .route("/metrics", web::get().to(prometheus_metrics))
        })
        .disable_signals()
        .workers(1)
        .bind(bind_address)
        .with_context(|| format!("cannot bind health listener {}", bind_address))?;

        let bound_addr = bound
            .addrs()
            .first()
            .copied()
            .context("no bound health address")?;
        let http_server = bound.run();
        let handle = http_server.handle();
        spawn_task("registry-health", async move {
            if let Err(e) = http_server.await {
                error!("health listener terminated: {}", e);
            }
        });
        info!("health endpoint listening on http://{}", bound_addr);
        Ok(Self { handle, bound_addr })
    }

    pub fn bound_addr(&self) -> std::net::SocketAddr {
        self.bound_addr
    }

    pub async fn stop(&self) {
        self.handle.stop(false).await;
    }
}

async fn health(context: Data<HealthContext>) -> HttpResponse {
    let (total, _) = context.registry.state().counts().await;
    HttpResponse::Ok()
        .insert_header((header::CONNECTION, "close"))
        .json(json!({
            "status": "ok",
            "uptimeSeconds": context.registry.uptime_seconds(),
            "nodesTotal": total,
        }))
}

async fn prometheus_metrics(context: Data<HealthContext>) -> HttpResponse {
    let Some(handle) = context.prometheus.as_ref() else {
        return HttpResponse::NotFound()
            .insert_header((header::CONNECTION, "close"))
            .body("Prometheus metrics are not enabled");
    };

    let registry = &context.registry;
    let (total, online) = registry.state().counts().await;
    gauge!("registry_nodes_total").set(total as f64);
    gauge!("registry_nodes_online").set(online as f64);
    gauge!("registry_uptime_seconds").set(registry.uptime_seconds() as f64);
    gauge!("registry_last_saved_ts").set(registry.state().last_saved_ts().await as f64);
    counter!("registry_rate_limited_total").absolute(registry.rate_limited_total());

    HttpResponse::Ok()
        .insert_header((header::CONNECTION, "close"))
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}
