use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use fabric_common::card::CapabilityCard;
use fabric_common::knowledge::{KnowledgePack, PackMeta};
use fabric_common::protocol::{
    KnowledgePublishOkPayload, KnowledgePublishPayload, LeaderboardResultPayload,
    ListResultPayload, NodeSummary, ResolveOkPayload, SyncNode,
};
use fabric_common::time::{TimestampMillis, TimestampSeconds};

mod snapshot;
mod store;

pub use snapshot::SnapshotDoc;
pub use store::{ListQuery, RegistryStore};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown node")]
    UnknownNode,
    #[error("unknown reservation")]
    UnknownReservation,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("invalid points")]
    InvalidPoints,
    #[error("payerNode required")]
    MintingDisabled,
    #[error("unknown knowledge pack")]
    UnknownPack,
    #[error("pack already exists")]
    PackExists,
    #[error("owner mismatch")]
    OwnerMismatch,
    #[error("pack too large: {size} bytes (max {max})")]
    PackTooLarge { size: usize, max: usize },
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One directory entry: identity and presentation set by the node itself,
/// runtime liveness, the points ledger, and task telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    #[serde(default)]
    pub capability_card: CapabilityCard,
    #[serde(default = "default_price_points")]
    pub price_points: u64,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen_ts: TimestampSeconds,
    #[serde(default)]
    pub completed_tasks: u64,
    #[serde(default)]
    pub earned_points: u64,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub spent_points: u64,
    #[serde(default)]
    pub held_points: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub total_latency_ms: TimestampMillis,
}

fn default_price_points() -> u64 {
    1
}

impl NodeEntry {
    pub fn avg_latency_ms(&self) -> TimestampMillis {
        let reports = self.success_count + self.fail_count;
        if reports == 0 {
            0
        } else {
            self.total_latency_ms / reports
        }
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            capabilities: self.capabilities.clone(),
            capability_card: self.capability_card.to_value(),
            price_points: self.price_points,
            online: self.online,
            completed_tasks: self.completed_tasks,
            earned_points: self.earned_points,
            balance: self.balance,
            spent_points: self.spent_points,
            held_points: self.held_points,
            success_count: self.success_count,
            fail_count: self.fail_count,
            avg_latency_ms: self.avg_latency_ms(),
            last_seen_ts: self.last_seen_ts,
        }
    }
}

/// Presentational fields accepted on register/update. Ledger and telemetry
/// never come from the wire; they are preserved across upserts.
#[derive(Clone, Debug)]
pub struct NodeUpsert {
    pub node_id: String,
    pub node_name: String,
    pub endpoint_url: String,
    pub capabilities: HashMap<String, bool>,
    pub capability_card: CapabilityCard,
    pub price_points: u64,
}

/// A preauthorized, not-yet-committed debit held against a payer on behalf
/// of a provider. The points are already subtracted from the payer's
/// balance and tracked in its heldPoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub payer_node: String,
    pub provider_node: String,
    pub points: u64,
    #[serde(default)]
    pub created_ts: TimestampSeconds,
}

#[derive(Clone, Debug)]
pub struct StateConfig {
    pub initial_points: u64,
    pub knowledge_max_bytes: usize,
    pub allow_mint: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            initial_points: fabric_common::config::DEFAULT_INITIAL_POINTS,
            knowledge_max_bytes: fabric_common::config::DEFAULT_KNOWLEDGE_MAX_BYTES,
            allow_mint: false,
        }
    }
}

/// Authoritative in-memory registry state behind one coarse mutex.
///
/// Every mutation touches several fields that must move together (balance,
/// held points, the reservation table, the capability index), so a single
/// lock is the invariant boundary, not an optimization target.
pub struct RegistryState {
    store: Mutex<RegistryStore>,
}

impl RegistryState {
    pub fn new(cfg: StateConfig) -> Self {
        Self {
            store: Mutex::new(RegistryStore::new(cfg)),
        }
    }

    pub async fn upsert_node(&self, upsert: NodeUpsert) -> bool {
        self.store.lock().await.upsert_node(upsert)
    }

    pub async fn set_offline(&self, node_id: &str) {
        self.store.lock().await.set_offline(node_id);
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeEntry> {
        self.store.lock().await.get(node_id).cloned()
    }

    pub async fn list_page(&self, query: ListQuery) -> ListResultPayload {
        self.store.lock().await.list_page(&query)
    }

    pub async fn resolve(&self, node_id: &str) -> Result<ResolveOkPayload, RegistryError> {
        self.store.lock().await.resolve(node_id)
    }

    pub async fn reserve(
        &self,
        payer_node: &str,
        provider_node: &str,
        points: u64,
    ) -> Result<String, RegistryError> {
        self.store
            .lock()
            .await
            .reserve(payer_node, provider_node, points)
    }

    pub async fn commit(&self, reservation_id: &str) -> Result<(), RegistryError> {
        self.store.lock().await.commit(reservation_id)
    }

    pub async fn cancel(&self, reservation_id: &str) -> Result<(), RegistryError> {
        self.store.lock().await.cancel(reservation_id)
    }

    pub async fn award(
        &self,
        node_id: &str,
        points: u64,
        payer_node: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.store.lock().await.award(node_id, points, payer_node)
    }

    pub async fn report(
        &self,
        node_id: &str,
        ok: bool,
        latency_ms: TimestampMillis,
    ) -> Result<(), RegistryError> {
        self.store.lock().await.report(node_id, ok, latency_ms)
    }

    pub async fn leaderboard(
        &self,
        sort_by: Option<&str>,
        limit: Option<usize>,
    ) -> LeaderboardResultPayload {
        self.store.lock().await.leaderboard(sort_by, limit)
    }

    pub async fn sync_merge(&self, nodes: Vec<SyncNode>) -> usize {
        self.store.lock().await.sync_merge(nodes)
    }

    pub async fn export_sync(&self, limit: usize) -> Vec<SyncNode> {
        self.store.lock().await.export_sync(limit)
    }

    pub async fn apply_ttl(&self, ttl_secs: u64) -> usize {
        self.store.lock().await.apply_ttl(ttl_secs)
    }

    pub async fn expire_reservations(&self, ttl_secs: u64) -> usize {
        self.store.lock().await.expire_reservations(ttl_secs)
    }

    pub async fn knowledge_publish(
        &self,
        publish: &KnowledgePublishPayload,
    ) -> Result<KnowledgePublishOkPayload, RegistryError> {
        self.store.lock().await.knowledge_publish(publish)
    }

    pub async fn knowledge_list(
        &self,
        kind: Option<&str>,
        tag: Option<&str>,
        owner_node: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<PackMeta> {
        self.store
            .lock()
            .await
            .knowledge_list(kind, tag, owner_node, limit)
    }

    pub async fn knowledge_get(&self, id: &str) -> Result<KnowledgePack, RegistryError> {
        self.store.lock().await.knowledge_get(id).cloned()
    }

    /// (total, online) node counts for health reporting.
    pub async fn counts(&self) -> (usize, usize) {
        self.store.lock().await.counts()
    }

    pub async fn last_saved_ts(&self) -> TimestampSeconds {
        self.store.lock().await.last_saved_ts
    }

    /// Write the snapshot if anything changed since the last save.
    pub async fn save_if_dirty(&self, path: &Path) -> Result<bool, RegistryError> {
        let mut store = self.store.lock().await;
        if !store.dirty {
            return Ok(false);
        }
        snapshot::save(&mut store, path)?;
        Ok(true)
    }

    /// Unconditional snapshot write (shutdown path).
    pub async fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let mut store = self.store.lock().await;
        snapshot::save(&mut store, path)
    }

    /// Load a snapshot from disk. Missing or corrupt files leave the state
    /// empty; the registry must come up regardless.
    pub async fn load(&self, path: &Path) {
        let mut store = self.store.lock().await;
        snapshot::load(&mut store, path);
    }
}
