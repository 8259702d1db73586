use clap::Parser;
use fabric_common::config::{
    DEFAULT_INITIAL_POINTS, DEFAULT_KNOWLEDGE_MAX_BYTES, DEFAULT_NODE_TTL_SECS,
    DEFAULT_PREAUTH_TTL_SECS, DEFAULT_REGISTRY_BIND_ADDRESS,
    DEFAULT_REGISTRY_RATE_BURST, DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN,
};

// How often the periodic snapshot task checks for unsaved state
pub const SNAPSHOT_INTERVAL_SECS: u64 = 30;

// Default sync interval for the federation bridge
pub const DEFAULT_BRIDGE_INTERVAL_SECS: u64 = 15;

/// Registry server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "fabric_registry", version, about = "Fabric federation registry")]
pub struct Config {
    /// WebSocket bind address
    #[clap(long, default_value = DEFAULT_REGISTRY_BIND_ADDRESS)]
    pub bind_address: String,
    /// Shared registry token; empty disables authentication
    #[clap(long, default_value = "")]
    pub token: String,
    /// Path to the snapshot file; state is memory-only when unset
    #[clap(long)]
    pub state_file: Option<String>,
    /// Offline TTL for nodes (seconds)
    #[clap(long, default_value_t = DEFAULT_NODE_TTL_SECS)]
    pub ttl: u64,
    /// Reservation TTL (seconds); stale reservations are auto-cancelled
    #[clap(long, default_value_t = DEFAULT_PREAUTH_TTL_SECS)]
    pub preauth_ttl: u64,
    /// Points granted to a node on first registration
    #[clap(long, default_value_t = DEFAULT_INITIAL_POINTS)]
    pub initial_points: u64,
    /// Allow `award` without a payer (mints points into the provider)
    #[clap(long, default_value_t = false)]
    pub allow_mint: bool,
    /// Rate limit per client IP (requests per minute)
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN)]
    pub rate_limit: u32,
    /// Rate limit burst per client IP
    #[clap(long, default_value_t = DEFAULT_REGISTRY_RATE_BURST)]
    pub rate_burst: u32,
    /// Maximum knowledge pack content size in bytes
    #[clap(long, default_value_t = DEFAULT_KNOWLEDGE_MAX_BYTES)]
    pub knowledge_max_bytes: usize,
    /// Bind address for the plain-HTTP /health and /metrics listener
    #[clap(long)]
    pub health_bind_address: Option<String>,
    /// Peer registry URL to push sync to (repeatable)
    #[clap(long = "bridge-peer")]
    pub bridge_peers: Vec<String>,
    /// Bridge sync interval (seconds)
    #[clap(long, default_value_t = DEFAULT_BRIDGE_INTERVAL_SECS)]
    pub bridge_interval: u64,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_REGISTRY_BIND_ADDRESS.to_string(),
            token: String::new(),
            state_file: None,
            ttl: DEFAULT_NODE_TTL_SECS,
            preauth_ttl: DEFAULT_PREAUTH_TTL_SECS,
            initial_points: DEFAULT_INITIAL_POINTS,
            allow_mint: false,
            rate_limit: DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN,
            rate_burst: DEFAULT_REGISTRY_RATE_BURST,
            knowledge_max_bytes: DEFAULT_KNOWLEDGE_MAX_BYTES,
            health_bind_address: None,
            bridge_peers: Vec::new(),
            bridge_interval: DEFAULT_BRIDGE_INTERVAL_SECS,
            log_level: log::LevelFilter::Info,
        }
    }
}
