use std::time::Duration;

use fabric_common::config::{DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_TASK_TIMEOUT_SECS};

/// Everything the delegation pipeline needs to find, pay and call a
/// provider node. Empty strings mean "not configured".
#[derive(Clone, Debug)]
pub struct DelegationConfig {
    pub registry_url: String,
    pub registry_token: String,
    /// Payer identity for preauth; also forwarded to nodes for their
    /// per-client rate limiting.
    pub client_id: String,
    pub service_token: String,
    pub relay_url: String,
    pub relay_token: String,
    /// Never fall back to direct endpoints when the relay path fails.
    pub relay_only: bool,
    pub preauth_enabled: bool,
    /// Abort when preauth is enabled but token/clientId are missing.
    pub preauth_required: bool,
    pub max_price_points: Option<u64>,
    /// Read deadline for registry round trips.
    pub request_timeout: Duration,
    /// Read deadline for the task call itself (LLM calls can be slow).
    pub task_timeout: Duration,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            registry_url: "ws://127.0.0.1:18999".to_string(),
            registry_token: String::new(),
            client_id: String::new(),
            service_token: String::new(),
            relay_url: String::new(),
            relay_token: String::new(),
            relay_only: false,
            preauth_enabled: true,
            preauth_required: false,
            max_price_points: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}
