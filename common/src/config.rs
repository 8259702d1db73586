pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: u32 = 1;

// Default bind addresses
pub const DEFAULT_REGISTRY_BIND_ADDRESS: &str = "0.0.0.0:18999";
pub const DEFAULT_RELAY_BIND_ADDRESS: &str = "0.0.0.0:19001";
pub const DEFAULT_NODE_BIND_ADDRESS: &str = "0.0.0.0:18998";

// Paging / listing bounds enforced by the registry
pub const MAX_PAGE_SIZE: usize = 200;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_LEADERBOARD_LIMIT: usize = 200;
pub const DEFAULT_KNOWLEDGE_LIMIT: usize = 50;
pub const MAX_KNOWLEDGE_LIMIT: usize = 200;

// Knowledge pack bounds
pub const DEFAULT_KNOWLEDGE_MAX_BYTES: usize = 50_000;
pub const MAX_PACK_TAGS: usize = 20;
pub const MAX_PACK_TAG_LEN: usize = 32;

// Node liveness / reservation TTLs (seconds)
pub const DEFAULT_NODE_TTL_SECS: u64 = 120;
pub const DEFAULT_PREAUTH_TTL_SECS: u64 = 300;

// Points granted to a node on its very first registration
pub const DEFAULT_INITIAL_POINTS: u64 = 10;

// Rate limiting defaults (per minute)
pub const DEFAULT_REGISTRY_RATE_LIMIT_PER_MIN: u32 = 120;
pub const DEFAULT_REGISTRY_RATE_BURST: u32 = 120;
pub const DEFAULT_NODE_RATE_LIMIT_PER_MIN: u32 = 60;
pub const DEFAULT_NODE_RATE_BURST: u32 = 60;

// Relay pending-request cleanup timeout (seconds)
pub const DEFAULT_PENDING_TTL_SECS: u64 = 120;

// Reconnect backoff for persistent uplinks (registry register loop,
// relay node client): starts at 1s, doubles, capped at 30s
pub const RECONNECT_BACKOFF_START_SECS: u64 = 1;
pub const RECONNECT_BACKOFF_MAX_SECS: u64 = 30;

// Interval between keepalive `update` frames on the register connection
pub const REGISTER_UPDATE_INTERVAL_SECS: u64 = 30;

// Default read deadline for client-side request/response round trips
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
// Task execution can be slow (LLM calls); direct/relay calls get more room
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 120;
