use clap::Parser;
use fabric_common::config::{
    DEFAULT_NODE_BIND_ADDRESS, DEFAULT_NODE_RATE_BURST, DEFAULT_NODE_RATE_LIMIT_PER_MIN,
};

// Minimum interval between knowledge auto-publish scans
pub const MIN_PUBLISH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 300;

// Timeout for the optional startup self-check ping
pub const SELF_CHECK_TIMEOUT_SECS: u64 = 3;

/// Node service configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "fabric_node", version, about = "Fabric federation node service")]
pub struct Config {
    /// WebSocket bind address for the task intake endpoint
    #[clap(long, default_value = DEFAULT_NODE_BIND_ADDRESS)]
    pub bind_address: String,
    /// Service token required on task_run frames; empty disables the check
    #[clap(long, default_value = "")]
    pub service_token: String,
    /// Stable node id; generated when empty (persist it for stability)
    #[clap(long, default_value = "")]
    pub node_id: String,
    /// Human-readable node name
    #[clap(long, default_value = "")]
    pub node_name: String,
    /// Registry WebSocket URL to register with
    #[clap(long, default_value = "ws://127.0.0.1:18999")]
    pub registry_url: String,
    /// Registry token
    #[clap(long, default_value = "")]
    pub registry_token: String,
    /// Advertised endpoint URL; derived from the bind address when empty
    #[clap(long, default_value = "")]
    pub advertise_url: String,
    /// Price in points charged per task
    #[clap(long, default_value_t = 1)]
    pub price_points: u64,
    /// Capabilities advertised to the registry (comma separated)
    #[clap(long, default_value = "llm.chat,echo", value_delimiter = ',')]
    pub capabilities: Vec<String>,
    /// Allow multi-step `agent` tasks
    #[clap(long, default_value_t = false)]
    pub allow_agent_tasks: bool,
    /// Maximum completion tokens (clamped to 2048)
    #[clap(long, default_value_t = 1024)]
    pub max_tokens: u32,
    /// Iteration cap for agent tasks
    #[clap(long, default_value_t = 8)]
    pub agent_max_iterations: u32,
    /// Relay WebSocket URL; enables the relay uplink when set
    #[clap(long, default_value = "")]
    pub relay_url: String,
    /// Relay token
    #[clap(long, default_value = "")]
    pub relay_token: String,
    /// Serve through the relay only (no direct listener, empty endpoint)
    #[clap(long, default_value_t = false)]
    pub relay_only: bool,
    /// Rate limit per client IP (requests per minute)
    #[clap(long, default_value_t = DEFAULT_NODE_RATE_LIMIT_PER_MIN)]
    pub rate_limit: u32,
    /// Rate limit burst per client IP
    #[clap(long, default_value_t = DEFAULT_NODE_RATE_BURST)]
    pub rate_burst: u32,
    /// Rate limit per caller-supplied client id (requests per minute)
    #[clap(long, default_value_t = DEFAULT_NODE_RATE_LIMIT_PER_MIN)]
    pub rate_limit_by_client: u32,
    /// Rate limit burst per caller-supplied client id
    #[clap(long, default_value_t = DEFAULT_NODE_RATE_BURST)]
    pub rate_burst_by_client: u32,
    /// Directory of knowledge pack JSON files to auto-publish
    #[clap(long)]
    pub knowledge_publish_dir: Option<String>,
    /// Interval between auto-publish scans (seconds)
    #[clap(long, default_value_t = DEFAULT_PUBLISH_INTERVAL_SECS)]
    pub knowledge_publish_interval: u64,
    /// Ping the advertised endpoint once at startup and warn on failure
    #[clap(long, default_value_t = false)]
    pub self_check: bool,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_NODE_BIND_ADDRESS.to_string(),
            service_token: String::new(),
            node_id: String::new(),
            node_name: String::new(),
            registry_url: "ws://127.0.0.1:18999".to_string(),
            registry_token: String::new(),
            advertise_url: String::new(),
            price_points: 1,
            capabilities: vec!["llm.chat".to_string(), "echo".to_string()],
            allow_agent_tasks: false,
            max_tokens: 1024,
            agent_max_iterations: 8,
            relay_url: String::new(),
            relay_token: String::new(),
            relay_only: false,
            rate_limit: DEFAULT_NODE_RATE_LIMIT_PER_MIN,
            rate_burst: DEFAULT_NODE_RATE_BURST,
            rate_limit_by_client: DEFAULT_NODE_RATE_LIMIT_PER_MIN,
            rate_burst_by_client: DEFAULT_NODE_RATE_BURST,
            knowledge_publish_dir: None,
            knowledge_publish_interval: DEFAULT_PUBLISH_INTERVAL_SECS,
            self_check: false,
            log_level: log::LevelFilter::Info,
        }
    }
}
