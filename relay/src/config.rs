use clap::Parser;
use fabric_common::config::{
    DEFAULT_PENDING_TTL_SECS, DEFAULT_REGISTRY_RATE_BURST,
    DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN, DEFAULT_RELAY_BIND_ADDRESS,
};

/// Relay server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "fabric_relay", version, about = "Fabric federation relay")]
pub struct Config {
    /// WebSocket bind address
    #[clap(long, default_value = DEFAULT_RELAY_BIND_ADDRESS)]
    pub bind_address: String,
    /// Shared relay token for nodes and clients; empty disables the check
    #[clap(long, default_value = "")]
    pub relay_token: String,
    /// Cleanup timeout for pending requests (seconds)
    #[clap(long, default_value_t = DEFAULT_PENDING_TTL_SECS)]
    pub pending_ttl: u64,
    /// Rate limit per client IP (requests per minute)
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN)]
    pub rate_limit: u32,
    /// Rate limit burst per client IP
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_BURST)]
    pub rate_burst: u32,
    /// Rate limit per caller-supplied client id (requests per minute)
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN)]
    pub rate_limit_by_client: u32,
    /// Rate limit burst per caller-supplied client id
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_BURST)]
    pub rate_burst_by_client: u32,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_RELAY_BIND_ADDRESS.to_string(),
            relay_token: String::new(),
            pending_ttl: DEFAULT_PENDING_TTL_SECS,
            rate_limit: DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN,
            rate_burst: DEFAULT_REGISTRY_RATE_BURST,
            rate_limit_by_client: DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN,
            rate_burst_by_client: DEFAULT_REGISTRY_RATE_BURST,
            log_level: log::LevelFilter::Info,
        }
    }
}
