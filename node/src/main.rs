use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info, warn};

use fabric_common::config::VERSION;
use fabric_common::protocol::{new_id, Envelope};
use fabric_common::task::spawn_task;
use fabric_common::ws::{expect_kind, request_once};

use fabric_node::config::{Config, SELF_CHECK_TIMEOUT_SECS};
use fabric_node::executor::{ExecutorConfig, TaskExecutor};
use fabric_node::publish::{run_publish_loop, PublishConfig};
use fabric_node::register::{
    build_capabilities, build_capability_card, run_register_loop, Registration,
};
use fabric_node::relay_client::{RelayClientConfig, RelayNodeClient};
use fabric_node::service::NodeServer;

fn advertise_url(cfg: &Config, bound: std::net::SocketAddr) -> String {
    if !cfg.advertise_url.is_empty() {
        return cfg.advertise_url.clone();
    }
    if bound.ip().is_unspecified() {
        // only useful for same-machine testing
        return format!("ws://127.0.0.1:{}", bound.port());
    }
    format!("ws://{}", bound)
}

async fn self_check(endpoint_url: &str) -> bool {
    let ping = Envelope::new("ping");
    match request_once(
        endpoint_url,
        &ping,
        Duration::from_secs(SELF_CHECK_TIMEOUT_SECS),
    )
    .await
    {
        Ok(reply) => expect_kind(reply, "pong").is_ok(),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = Config::parse();
    fabric_common::logger::init(config.log_level).context("logger init failed")?;
    info!("fabric node v{}", VERSION);

    if config.node_id.is_empty() {
        config.node_id = new_id();
        warn!(
            "node_id missing; generated {} (persist it in config for stability)",
            config.node_id
        );
    }

    let mut relay_only = config.relay_only;
    if relay_only && config.relay_url.is_empty() {
        warn!("relay_only is set but relay_url is empty; falling back to direct mode");
        relay_only = false;
    }

    let executor = Arc::new(TaskExecutor::new(
        ExecutorConfig {
            allow_agent_tasks: config.allow_agent_tasks,
            max_tokens: config.max_tokens,
            agent_max_iterations: config.agent_max_iterations,
            ..Default::default()
        },
        // chat provider and agent tools are wired in by embedders; the
        // stock binary serves echo (and errors cleanly on llm.chat)
        None,
        Vec::new(),
    ));

    let mut endpoint_url = String::new();
    let server = if relay_only {
        None
    } else {
        let server = NodeServer::start(config.clone(), Arc::clone(&executor)).await?;
        endpoint_url = advertise_url(&config, server.bound_addr());
        if endpoint_url.starts_with("ws://127.0.0.1") {
            warn!("advertised endpoint is localhost; other machines cannot reach this node");
        }
        if config.self_check && !self_check(&endpoint_url).await {
            warn!(
                "self-check failed for {} (NAT or firewall may block)",
                endpoint_url
            );
        }
        Some(server)
    };

    let capabilities = build_capabilities(&config);
    let capability_card = build_capability_card(&config, &capabilities);

    spawn_task("node-register", run_register_loop(Registration {
        registry_url: config.registry_url.clone(),
        registry_token: config.registry_token.clone(),
        node_id: config.node_id.clone(),
        node_name: config.node_name.clone(),
        endpoint_url,
        capabilities,
        capability_card,
        price_points: config.price_points.max(1),
    }));

    if !config.relay_url.is_empty() {
        let relay = RelayNodeClient::new(
            RelayClientConfig {
                relay_url: config.relay_url.clone(),
                node_id: config.node_id.clone(),
                relay_token: config.relay_token.clone(),
                service_token: config.service_token.clone(),
                rate_limit: config.rate_limit,
                rate_burst: config.rate_burst,
                rate_limit_by_client: config.rate_limit_by_client,
                rate_burst_by_client: config.rate_burst_by_client,
            },
            Arc::clone(&executor),
        );
        info!("relay client starting ({})", config.relay_url);
        spawn_task("node-relay-client", async move {
            relay.run_forever().await;
        });
    }

    if let Some(dir) = config.knowledge_publish_dir.clone() {
        spawn_task("node-knowledge-publish", run_publish_loop(PublishConfig {
            registry_url: config.registry_url.clone(),
            registry_token: config.registry_token.clone(),
            node_id: config.node_id.clone(),
            dir: PathBuf::from(dir),
            interval_secs: config.knowledge_publish_interval,
        }));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {}", e);
    }
    info!("shutdown requested");
    if let Some(server) = server {
        server.stop().await;
    }
    Ok(())
}
