use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use fabric_common::config::{
    DEFAULT_KNOWLEDGE_LIMIT, DEFAULT_PAGE_SIZE, MAX_KNOWLEDGE_LIMIT, MAX_LEADERBOARD_LIMIT,
    MAX_PAGE_SIZE,
};
use fabric_common::card::CapabilityCard;
use fabric_common::knowledge::{content_hash, sanitize_tags, KnowledgePack, PackMeta};
use fabric_common::protocol::{
    new_id, truthy, KnowledgePublishOkPayload, KnowledgePublishPayload,
    LeaderboardResultPayload, ListResultPayload, ResolveOkPayload, SyncNode,
};
use fabric_common::time::{get_current_time_in_seconds, TimestampMillis, TimestampSeconds};

use super::{NodeEntry, NodeUpsert, RegistryError, Reservation, StateConfig};

const DEFAULT_LEADERBOARD_LIMIT: usize = 50;

/// Capability-filtered, paged listing parameters.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub online_only: bool,
    pub require_capabilities: Vec<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Synchronous registry store: nodes, the capability index, the
/// reservation table and the knowledge pack shelf. All invariants live
/// here; the async wrapper only adds the lock.
pub struct RegistryStore {
    cfg: StateConfig,
    nodes: HashMap<String, NodeEntry>,
    cap_index: HashMap<String, HashSet<String>>,
    reservations: IndexMap<String, Reservation>,
    knowledge: IndexMap<String, KnowledgePack>,
    pub(super) dirty: bool,
    pub(super) last_saved_ts: TimestampSeconds,
}

impl RegistryStore {
    pub fn new(cfg: StateConfig) -> Self {
        Self {
            cfg,
            nodes: HashMap::new(),
            cap_index: HashMap::new(),
            reservations: IndexMap::new(),
            knowledge: IndexMap::new(),
            dirty: false,
            last_saved_ts: 0,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    pub fn counts(&self) -> (usize, usize) {
        let online = self.nodes.values().filter(|n| n.online).count();
        (self.nodes.len(), online)
    }

    /// Upsert a node entry, preserving its ledger and telemetry. Grants
    /// the configured initial points on first insert. Returns true when
    /// the node was newly created.
    pub fn upsert_node(&mut self, upsert: NodeUpsert) -> bool {
        let now = get_current_time_in_seconds();
        let old_caps = self
            .nodes
            .get(&upsert.node_id)
            .map(|old| old.capabilities.clone());
        let created = old_caps.is_none();

        let entry = match self.nodes.get_mut(&upsert.node_id) {
            Some(existing) => {
                existing.node_name = upsert.node_name;
                existing.endpoint_url = upsert.endpoint_url;
                existing.capabilities = upsert.capabilities;
                existing.capability_card = upsert.capability_card;
                existing.price_points = upsert.price_points.max(1);
                existing.online = true;
                existing.last_seen_ts = now;
                existing.clone()
            }
            None => {
                let entry = NodeEntry {
                    node_id: upsert.node_id.clone(),
                    node_name: upsert.node_name,
                    endpoint_url: upsert.endpoint_url,
                    capabilities: upsert.capabilities,
                    capability_card: upsert.capability_card,
                    price_points: upsert.price_points.max(1),
                    online: true,
                    last_seen_ts: now,
                    completed_tasks: 0,
                    earned_points: 0,
                    balance: self.cfg.initial_points,
                    spent_points: 0,
                    held_points: 0,
                    success_count: 0,
                    fail_count: 0,
                    total_latency_ms: 0,
                };
                self.nodes.insert(upsert.node_id.clone(), entry.clone());
                entry
            }
        };

        self.reindex(&entry, old_caps.as_ref());
        self.dirty = true;
        created
    }

    /// Rebuild the capability index rows for one node. A node is indexed
    /// for a capability iff its flag is truthy.
    fn reindex(&mut self, entry: &NodeEntry, old_caps: Option<&HashMap<String, bool>>) {
        if let Some(old) = old_caps {
            for cap in old.keys() {
                if let Some(ids) = self.cap_index.get_mut(cap) {
                    ids.remove(&entry.node_id);
                    if ids.is_empty() {
                        self.cap_index.remove(cap);
                    }
                }
            }
        }
        for (cap, enabled) in &entry.capabilities {
            if !*enabled {
                continue;
            }
            self.cap_index
                .entry(cap.clone())
                .or_default()
                .insert(entry.node_id.clone());
        }
    }

    pub fn set_offline(&mut self, node_id: &str) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.online = false;
            entry.last_seen_ts = get_current_time_in_seconds();
            self.dirty = true;
        }
    }

    /// Flip stale online entries to offline. Counters are untouched.
    pub fn apply_ttl(&mut self, ttl_secs: u64) -> usize {
        if ttl_secs == 0 {
            return 0;
        }
        let cutoff = get_current_time_in_seconds().saturating_sub(ttl_secs);
        let mut flipped = 0;
        for entry in self.nodes.values_mut() {
            if entry.online && entry.last_seen_ts < cutoff {
                entry.online = false;
                flipped += 1;
            }
        }
        if flipped > 0 {
            self.dirty = true;
        }
        flipped
    }

    pub fn list_page(&self, query: &ListQuery) -> ListResultPayload {
        let page = query.page.unwrap_or(1).clamp(1, MAX_PAGE_SIZE);
        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let mut candidates: Vec<&NodeEntry> = if query.require_capabilities.is_empty() {
            self.nodes.values().collect()
        } else {
            let mut ids: Option<HashSet<&String>> = None;
            for cap in &query.require_capabilities {
                let cap_ids: HashSet<&String> = self
                    .cap_index
                    .get(cap)
                    .map(|s| s.iter().collect())
                    .unwrap_or_default();
                ids = Some(match ids {
                    None => cap_ids,
                    Some(acc) => acc.intersection(&cap_ids).copied().collect(),
                });
            }
            ids.unwrap_or_default()
                .into_iter()
                .filter_map(|id| self.nodes.get(id))
                .collect()
        };

        if query.online_only {
            candidates.retain(|n| n.online);
        }
        // Stable nodeId order makes paging deterministic across calls
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let total = candidates.len();
        let nodes = candidates
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(NodeEntry::summary)
            .collect();

        ListResultPayload {
            page,
            page_size,
            total,
            nodes,
        }
    }

    pub fn resolve(&self, node_id: &str) -> Result<ResolveOkPayload, RegistryError> {
        let entry = self.nodes.get(node_id).ok_or(RegistryError::UnknownNode)?;
        Ok(ResolveOkPayload {
            node_id: entry.node_id.clone(),
            endpoint_url: entry.endpoint_url.clone(),
            online: entry.online,
            last_seen_ts: entry.last_seen_ts,
        })
    }

    /// Hold `points` from the payer on behalf of the provider. The debit
    /// happens immediately; commit or cancel settles it later.
    pub fn reserve(
        &mut self,
        payer_node: &str,
        provider_node: &str,
        points: u64,
    ) -> Result<String, RegistryError> {
        if points == 0 {
            return Err(RegistryError::InvalidPoints);
        }
        if !self.nodes.contains_key(provider_node) {
            return Err(RegistryError::UnknownNode);
        }
        let now = get_current_time_in_seconds();
        let payer = self
            .nodes
            .get_mut(payer_node)
            .ok_or(RegistryError::UnknownNode)?;
        if payer.balance < points {
            return Err(RegistryError::InsufficientBalance);
        }
        payer.balance -= points;
        payer.held_points += points;
        payer.last_seen_ts = now;

        let id = new_id();
        self.reservations.insert(
            id.clone(),
            Reservation {
                id: id.clone(),
                payer_node: payer_node.to_string(),
                provider_node: provider_node.to_string(),
                points,
                created_ts: now,
            },
        );
        self.dirty = true;
        Ok(id)
    }

    /// Settle a reservation: the held points become spent for the payer
    /// and earned balance for the provider, which also gets credit for one
    /// completed task.
    pub fn commit(&mut self, reservation_id: &str) -> Result<(), RegistryError> {
        let reservation = self
            .reservations
            .shift_remove(reservation_id)
            .ok_or(RegistryError::UnknownReservation)?;
        let now = get_current_time_in_seconds();
        if let Some(payer) = self.nodes.get_mut(&reservation.payer_node) {
            payer.held_points = payer.held_points.saturating_sub(reservation.points);
            payer.spent_points += reservation.points;
            payer.last_seen_ts = now;
        }
        if let Some(provider) = self.nodes.get_mut(&reservation.provider_node) {
            provider.balance += reservation.points;
            provider.earned_points += reservation.points;
            provider.completed_tasks += 1;
            provider.last_seen_ts = now;
        }
        self.dirty = true;
        Ok(())
    }

    /// Undo a reservation: the held points return to the payer's balance.
    pub fn cancel(&mut self, reservation_id: &str) -> Result<(), RegistryError> {
        let reservation = self
            .reservations
            .shift_remove(reservation_id)
            .ok_or(RegistryError::UnknownReservation)?;
        self.refund(&reservation);
        self.dirty = true;
        Ok(())
    }

    fn refund(&mut self, reservation: &Reservation) {
        if let Some(payer) = self.nodes.get_mut(&reservation.payer_node) {
            payer.balance += reservation.points;
            payer.held_points = payer.held_points.saturating_sub(reservation.points);
            payer.last_seen_ts = get_current_time_in_seconds();
        }
    }

    /// Auto-cancel reservations older than the TTL so lost clients cannot
    /// strand funds. Returns the number of refunds issued.
    pub fn expire_reservations(&mut self, ttl_secs: u64) -> usize {
        if ttl_secs == 0 {
            return 0;
        }
        let cutoff = get_current_time_in_seconds().saturating_sub(ttl_secs);
        let expired: Vec<Reservation> = self
            .reservations
            .values()
            .filter(|r| r.created_ts < cutoff)
            .cloned()
            .collect();
        for reservation in &expired {
            self.reservations.shift_remove(&reservation.id);
            self.refund(reservation);
        }
        if !expired.is_empty() {
            self.dirty = true;
        }
        expired.len()
    }

    /// Legacy single-call pay: debit the payer (when given) and credit the
    /// provider in one step. Without a payer this mints points, which is
    /// rejected unless the operator explicitly enabled it.
    pub fn award(
        &mut self,
        node_id: &str,
        points: u64,
        payer_node: Option<&str>,
    ) -> Result<(), RegistryError> {
        if points == 0 {
            return Err(RegistryError::InvalidPoints);
        }
        if !self.nodes.contains_key(node_id) {
            return Err(RegistryError::UnknownNode);
        }
        let now = get_current_time_in_seconds();
        match payer_node {
            Some(payer_id) => {
                let payer = self
                    .nodes
                    .get_mut(payer_id)
                    .ok_or(RegistryError::UnknownNode)?;
                if payer.balance < points {
                    return Err(RegistryError::InsufficientBalance);
                }
                payer.balance -= points;
                payer.spent_points += points;
                payer.last_seen_ts = now;
            }
            None => {
                if !self.cfg.allow_mint {
                    return Err(RegistryError::MintingDisabled);
                }
            }
        }
        let provider = self
            .nodes
            .get_mut(node_id)
            .expect("provider existence checked above");
        provider.balance += points;
        provider.earned_points += points;
        provider.completed_tasks += 1;
        provider.last_seen_ts = now;
        self.dirty = true;
        Ok(())
    }

    pub fn report(
        &mut self,
        node_id: &str,
        ok: bool,
        latency_ms: TimestampMillis,
    ) -> Result<(), RegistryError> {
        let entry = self
            .nodes
            .get_mut(node_id)
            .ok_or(RegistryError::UnknownNode)?;
        if ok {
            entry.success_count += 1;
        } else {
            entry.fail_count += 1;
        }
        entry.total_latency_ms += latency_ms;
        entry.last_seen_ts = get_current_time_in_seconds();
        self.dirty = true;
        Ok(())
    }

    pub fn leaderboard(
        &self,
        sort_by: Option<&str>,
        limit: Option<usize>,
    ) -> LeaderboardResultPayload {
        let sort_by = match sort_by {
            Some("balance") => "balance",
            Some("completedTasks") => "completedTasks",
            _ => "earnedPoints",
        };
        let limit = limit
            .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
            .clamp(1, MAX_LEADERBOARD_LIMIT);

        let mut entries: Vec<&NodeEntry> = self.nodes.values().collect();
        entries.sort_by(|a, b| {
            let key = |n: &NodeEntry| match sort_by {
                "balance" => n.balance,
                "completedTasks" => n.completed_tasks,
                _ => n.earned_points,
            };
            key(b).cmp(&key(a)).then_with(|| a.node_id.cmp(&b.node_id))
        });

        LeaderboardResultPayload {
            sort_by: sort_by.to_string(),
            limit,
            nodes: entries
                .into_iter()
                .take(limit)
                .map(NodeEntry::summary)
                .collect(),
        }
    }

    /// Bulk upsert from a peer registry. Only presentational fields and
    /// liveness are pulled in: the local ledger and telemetry are never
    /// overwritten, and bridged entries start with a zero ledger (no
    /// initial-points grant).
    pub fn sync_merge(&mut self, nodes: Vec<SyncNode>) -> usize {
        let mut merged = 0;
        for node in nodes {
            if node.node_id.is_empty() {
                continue;
            }
            let capabilities: HashMap<String, bool> = node
                .capabilities
                .iter()
                .map(|(k, v)| (k.clone(), truthy(v)))
                .collect();
            let card = CapabilityCard::sanitize(&node.capability_card);
            let old_caps = self
                .nodes
                .get(&node.node_id)
                .map(|old| old.capabilities.clone());

            let entry = match self.nodes.get_mut(&node.node_id) {
                Some(existing) => {
                    existing.node_name = node.node_name;
                    existing.endpoint_url = node.endpoint_url;
                    existing.capabilities = capabilities;
                    existing.capability_card = card;
                    existing.price_points = node.price_points.max(1);
                    existing.online = node.online;
                    existing.last_seen_ts = node.last_seen_ts;
                    existing.clone()
                }
                None => {
                    let entry = NodeEntry {
                        node_id: node.node_id.clone(),
                        node_name: node.node_name,
                        endpoint_url: node.endpoint_url,
                        capabilities,
                        capability_card: card,
                        price_points: node.price_points.max(1),
                        online: node.online,
                        last_seen_ts: node.last_seen_ts,
                        completed_tasks: 0,
                        earned_points: 0,
                        balance: 0,
                        spent_points: 0,
                        held_points: 0,
                        success_count: 0,
                        fail_count: 0,
                        total_latency_ms: 0,
                    };
                    self.nodes.insert(node.node_id.clone(), entry.clone());
                    entry
                }
            };
            self.reindex(&entry, old_caps.as_ref());
            merged += 1;
        }
        if merged > 0 {
            self.dirty = true;
        }
        merged
    }

    /// Online nodes as bridge payload entries (presentational fields only).
    pub fn export_sync(&self, limit: usize) -> Vec<SyncNode> {
        let mut entries: Vec<&NodeEntry> = self.nodes.values().filter(|n| n.online).collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
            .into_iter()
            .take(limit)
            .map(|n| SyncNode {
                node_id: n.node_id.clone(),
                node_name: n.node_name.clone(),
                endpoint_url: n.endpoint_url.clone(),
                capabilities: n
                    .capabilities
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::Bool(*v)))
                    .collect(),
                capability_card: n.capability_card.to_value(),
                price_points: n.price_points,
                online: n.online,
                last_seen_ts: n.last_seen_ts,
            })
            .collect()
    }

    pub fn knowledge_publish(
        &mut self,
        publish: &KnowledgePublishPayload,
    ) -> Result<KnowledgePublishOkPayload, RegistryError> {
        if publish.name.trim().is_empty() {
            return Err(RegistryError::Missing("name"));
        }
        if publish.kind.trim().is_empty() {
            return Err(RegistryError::Missing("kind"));
        }
        if publish.content.is_empty() {
            return Err(RegistryError::Missing("content"));
        }
        let size = publish.content.len();
        if size > self.cfg.knowledge_max_bytes {
            return Err(RegistryError::PackTooLarge {
                size,
                max: self.cfg.knowledge_max_bytes,
            });
        }

        let now = get_current_time_in_seconds();
        let id = publish
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_id);
        let hash = content_hash(&publish.content);
        let tags = sanitize_tags(&publish.tags);

        let created_ts = match self.knowledge.get(&id) {
            Some(existing) => {
                if !publish.allow_update {
                    return Err(RegistryError::PackExists);
                }
                if existing.owner_node != publish.owner_node {
                    return Err(RegistryError::OwnerMismatch);
                }
                existing.created_ts
            }
            None => now,
        };

        self.knowledge.insert(
            id.clone(),
            KnowledgePack {
                id: id.clone(),
                name: publish.name.trim().to_string(),
                kind: publish.kind.trim().to_string(),
                summary: publish.summary.trim().to_string(),
                content: publish.content.clone(),
                tags,
                version: publish.version.clone(),
                owner_node: publish.owner_node.clone(),
                created_ts,
                updated_ts: now,
                content_hash: hash.clone(),
                size_bytes: size,
            },
        );
        self.dirty = true;

        Ok(KnowledgePublishOkPayload {
            id,
            size_bytes: size,
            content_hash: hash,
            updated_ts: now,
        })
    }

    pub fn knowledge_list(
        &self,
        kind: Option<&str>,
        tag: Option<&str>,
        owner_node: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<PackMeta> {
        let limit = limit
            .unwrap_or(DEFAULT_KNOWLEDGE_LIMIT)
            .clamp(1, MAX_KNOWLEDGE_LIMIT);
        let mut packs: Vec<&KnowledgePack> = self
            .knowledge
            .values()
            .filter(|p| kind.map(|k| p.kind == k).unwrap_or(true))
            .filter(|p| owner_node.map(|o| p.owner_node == o).unwrap_or(true))
            .filter(|p| tag.map(|t| p.tags.iter().any(|pt| pt == t)).unwrap_or(true))
            .collect();
        packs.sort_by(|a, b| {
            b.updated_ts
                .cmp(&a.updated_ts)
                .then_with(|| a.id.cmp(&b.id))
        });
        packs.into_iter().take(limit).map(|p| p.meta()).collect()
    }

    pub fn knowledge_get(&self, id: &str) -> Result<&KnowledgePack, RegistryError> {
        self.knowledge.get(id).ok_or(RegistryError::UnknownPack)
    }

    // Snapshot import/export, used by the persistence layer.

    pub(super) fn export(&self) -> super::SnapshotDoc {
        super::SnapshotDoc {
            nodes: self.nodes.values().cloned().collect(),
            reservations: self.reservations.values().cloned().collect(),
            knowledge_packs: self.knowledge.values().cloned().collect(),
        }
    }

    pub(super) fn import(&mut self, doc: super::SnapshotDoc) {
        self.nodes.clear();
        self.cap_index.clear();
        self.reservations.clear();
        self.knowledge.clear();
        for entry in doc.nodes {
            if entry.node_id.is_empty() {
                continue;
            }
            self.nodes.insert(entry.node_id.clone(), entry.clone());
            self.reindex(&entry, None);
        }
        for reservation in doc.reservations {
            if reservation.id.is_empty() {
                continue;
            }
            self.reservations
                .insert(reservation.id.clone(), reservation);
        }
        for pack in doc.knowledge_packs {
            if pack.id.is_empty() {
                continue;
            }
            self.knowledge.insert(pack.id.clone(), pack);
        }
        self.dirty = false;
    }

    pub(super) fn mark_saved(&mut self) {
        self.dirty = false;
        self.last_saved_ts = get_current_time_in_seconds();
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&mut self, node_id: &str, ts: TimestampSeconds) {
        if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.last_seen_ts = ts;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_reservation_created(&mut self, reservation_id: &str, ts: TimestampSeconds) {
        if let Some(r) = self.reservations.get_mut(reservation_id) {
            r.created_ts = ts;
        }
    }

    #[cfg(test)]
    pub(crate) fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}
