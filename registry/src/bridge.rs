//! Federation bridge: periodic, best-effort push sync of the local online
//! directory to peer registries. Ordering across registries is eventual;
//! ledgers never cross the bridge.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;
use tokio::task::JoinHandle;

use fabric_common::config::MAX_PAGE_SIZE;
use fabric_common::protocol::Envelope;
use fabric_common::task::spawn_task;
use fabric_common::ws::{expect_kind, request_once};

use crate::state::RegistryState;

pub struct RegistryBridge {
    task: JoinHandle<()>,
}

impl RegistryBridge {
    /// Spawn the sync loop. Failures are logged and retried on the next
    /// tick; the loop only stops when the bridge is dropped via `stop`.
    pub fn start(
        state: Arc<RegistryState>,
        peers: Vec<String>,
        token: String,
        interval_secs: u64,
    ) -> Self {
        let task = spawn_task("registry-bridge", async move {
            let interval = Duration::from_secs(interval_secs.max(1));
            loop {
                tokio::time::sleep(interval).await;
                let nodes = state.export_sync(MAX_PAGE_SIZE).await;
                if nodes.is_empty() {
                    continue;
                }
                for peer in &peers {
                    match sync_once(peer, &nodes, &token).await {
                        Ok(merged) => {
                            debug!("bridge: pushed {} nodes to {} ({} merged)", nodes.len(), peer, merged)
                        }
                        Err(e) => warn!("bridge: sync to {} failed: {}", peer, e),
                    }
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn sync_once(
    peer: &str,
    nodes: &[fabric_common::protocol::SyncNode],
    token: &str,
) -> Result<u64, fabric_common::ws::WsClientError> {
    let env = Envelope::with_payload(
        "sync",
        json!({
            "nodes": nodes,
            "registryToken": token,
        }),
    );
    let reply = request_once(peer, &env, Duration::from_secs(10)).await?;
    let reply = expect_kind(reply, "sync_ok")?;
    Ok(reply
        .payload
        .get("merged")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0))
}
