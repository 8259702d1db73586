use anyhow::Context as _;
use clap::Parser;
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;

use fabric_common::config::VERSION;
use fabric_registry::bridge::RegistryBridge;
use fabric_registry::config::Config;
use fabric_registry::health::HealthServer;
use fabric_registry::server::RegistryServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    fabric_common::logger::init(config.log_level).context("logger init failed")?;
    info!("fabric registry v{}", VERSION);

    // Prometheus recorder is process-global; install it only when the
    // health listener will actually serve /metrics
    let prometheus = if config.health_bind_address.is_some() {
        let (recorder, _) = PrometheusBuilder::new()
            .build()
            .context("failed to create Prometheus recorder")?;
        let handle = recorder.handle();
        metrics::set_global_recorder(Box::new(recorder))
            .context("failed to set global Prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    let bridge_peers = config.bridge_peers.clone();
    let bridge_interval = config.bridge_interval;
    let bridge_token = config.token.clone();
    let health_bind = config.health_bind_address.clone();

    let server = RegistryServer::start(config).await?;

    let health = match health_bind {
        Some(bind) => Some(HealthServer::start(&bind, server.clone(), prometheus).await?),
        None => None,
    };

    let bridge = if bridge_peers.is_empty() {
        None
    } else {
        info!("bridge: syncing to {} peer(s)", bridge_peers.len());
        Some(RegistryBridge::start(
            server.state().clone(),
            bridge_peers,
            bridge_token,
            bridge_interval,
        ))
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {}", e);
    }
    info!("shutdown requested");

    if let Some(bridge) = bridge {
        bridge.stop();
    }
    if let Some(health) = health {
        health.stop().await;
    }
    server.stop().await;
    Ok(())
}
