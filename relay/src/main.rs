use anyhow::Context as _;
use clap::Parser;
use log::{error, info};

use fabric_common::config::VERSION;
use fabric_relay::config::Config;
use fabric_relay::server::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    fabric_common::logger::init(config.log_level).context("logger init failed")?;
    info!("fabric relay v{}", VERSION);

    let server = RelayServer::start(config).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {}", e);
    }
    info!("shutdown requested");
    server.stop().await;
    Ok(())
}
