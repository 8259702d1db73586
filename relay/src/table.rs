//! The relay's working state: the node uplink map and the pending-request
//! table. Generic over the session handle so the forwarding rules are
//! testable without sockets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A node's live uplink. The connection id distinguishes a stale entry
/// from a reconnect that has already replaced it.
#[derive(Clone, Debug)]
pub struct NodeLink<S> {
    pub conn_id: u64,
    pub session: S,
}

/// One in-flight client request awaiting a node's `relay_result`. The
/// internal id (table key) hides the client's request id from the node.
#[derive(Clone, Debug)]
pub struct PendingRequest<S> {
    pub conn_id: u64,
    pub session: S,
    pub client_request_id: String,
    pub created: Instant,
}

pub struct RelayTable<S> {
    nodes: HashMap<String, NodeLink<S>>,
    pending: HashMap<String, PendingRequest<S>>,
}

impl<S: Clone> RelayTable<S> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// A later `relay_hello` for the same node id wins.
    pub fn register_node(&mut self, node_id: &str, conn_id: u64, session: S) {
        self.nodes.insert(
            node_id.to_string(),
            NodeLink {
                conn_id,
                session,
            },
        );
    }

    pub fn node_session(&self, node_id: &str) -> Option<S> {
        self.nodes.get(node_id).map(|link| link.session.clone())
    }

    /// Remove the node mapping, but only if it still belongs to the given
    /// connection; a reconnected node must not be unregistered by the old
    /// connection's teardown.
    pub fn remove_node_if_owned(&mut self, node_id: &str, conn_id: u64) -> bool {
        match self.nodes.get(node_id) {
            Some(link) if link.conn_id == conn_id => {
                self.nodes.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn remove_node(&mut self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    pub fn insert_pending(
        &mut self,
        internal_id: &str,
        conn_id: u64,
        session: S,
        client_request_id: &str,
    ) {
        self.pending.insert(
            internal_id.to_string(),
            PendingRequest {
                conn_id,
                session,
                client_request_id: client_request_id.to_string(),
                created: Instant::now(),
            },
        );
    }

    /// Claim the pending entry for a `relay_result`. A result for an
    /// expired or unknown id yields None and is silently discarded by the
    /// caller.
    pub fn pop_pending(&mut self, internal_id: &str) -> Option<PendingRequest<S>> {
        self.pending.remove(internal_id)
    }

    /// Remove entries older than the TTL and hand them back so the caller
    /// can synthesize timeout responses for the waiting clients.
    pub fn sweep_expired(&mut self, ttl: Duration) -> Vec<PendingRequest<S>> {
        if ttl.is_zero() || self.pending.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Drop every pending entry belonging to a disconnected client. Its
    /// in-flight tasks get no reply; the node's results will be discarded.
    pub fn drop_client(&mut self, conn_id: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.conn_id != conn_id);
        before - self.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn backdate_pending(&mut self, internal_id: &str, age: Duration) {
        if let Some(p) = self.pending.get_mut(internal_id) {
            if let Some(created) = Instant::now().checked_sub(age) {
                p.created = created;
            }
        }
    }
}

impl<S: Clone> Default for RelayTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_hello_replaces_earlier_uplink() {
        let mut table: RelayTable<&'static str> = RelayTable::new();
        table.register_node("n", 1, "old");
        table.register_node("n", 2, "new");
        assert_eq!(table.node_session("n"), Some("new"));

        // teardown of the old connection must not remove the new uplink
        assert!(!table.remove_node_if_owned("n", 1));
        assert_eq!(table.node_session("n"), Some("new"));
        assert!(table.remove_node_if_owned("n", 2));
        assert_eq!(table.node_session("n"), None);
    }

    #[test]
    fn pending_pop_is_single_shot() {
        let mut table: RelayTable<()> = RelayTable::new();
        table.insert_pending("internal-1", 7, (), "client-req-1");
        let entry = table.pop_pending("internal-1").unwrap();
        assert_eq!(entry.client_request_id, "client-req-1");
        // a duplicate or late result finds nothing
        assert!(table.pop_pending("internal-1").is_none());
    }

    #[test]
    fn sweep_returns_only_expired_entries() {
        let mut table: RelayTable<()> = RelayTable::new();
        table.insert_pending("old", 1, (), "a");
        table.insert_pending("fresh", 1, (), "b");
        table.backdate_pending("old", Duration::from_secs(3));

        let expired = table.sweep_expired(Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_request_id, "a");
        assert_eq!(table.pending_len(), 1);
        assert!(table.pop_pending("fresh").is_some());
    }

    #[test]
    fn client_disconnect_drops_only_its_pendings() {
        let mut table: RelayTable<()> = RelayTable::new();
        table.insert_pending("x", 1, (), "a");
        table.insert_pending("y", 2, (), "b");
        assert_eq!(table.drop_client(1), 1);
        assert!(table.pop_pending("x").is_none());
        assert!(table.pop_pending("y").is_some());
    }

    #[test]
    fn zero_ttl_disables_the_sweep() {
        let mut table: RelayTable<()> = RelayTable::new();
        table.insert_pending("x", 1, (), "a");
        table.backdate_pending("x", Duration::from_secs(3));
        assert!(table.sweep_expired(Duration::ZERO).is_empty());
        assert_eq!(table.pending_len(), 1);
    }
}
