//! Registry of node sessions by node number
//!
//! The map lock is held only to look up or insert a session. Everything
//! else happens under the session's own lock, so traffic from different
//! nodes never contends. Never call into the registry while holding a
//! session lock.

use crate::session::{NodeSession, NodeSnapshot, SessionContext};
use crate::types::{NodeId, NodeStatus, Timestamp};
use crate::wifi::LineSink;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct SensorNet {
    ctx: Arc<SessionContext>,
    nodes: RwLock<HashMap<NodeId, Arc<NodeSession>>>,
}

impl SensorNet {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<NodeSession>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Session for `id`, created as `Unseen` if it is new.
    /// The flag is true when the session was just created.
    pub fn lookup_or_create(&self, id: NodeId) -> (Arc<NodeSession>, bool) {
        if let Some(node) = self.get(id) {
            return (node, false);
        }
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get(&id) {
            return (node.clone(), false);
        }
        debug!("Creating session for node {}", id);
        let node = NodeSession::new(id, self.ctx.clone());
        nodes.insert(id, node.clone());
        (node, true)
    }

    /// Lowest-numbered node other than `except` last seen at `ip`
    pub fn node_with_ip(&self, ip: &str, except: Option<NodeId>) -> Option<NodeId> {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes
            .iter()
            .filter(|n| Some(n.id()) != except)
            .filter(|n| n.ip().as_deref() == Some(ip))
            .map(|n| n.id())
            .min()
    }

    /// Record that node `id` is sending from `ip`
    ///
    /// A changed address is logged and overwrites the old one. Another node
    /// already using the address is logged too; both keep it.
    pub fn record_sighting(&self, id: NodeId, ip: &str) -> Arc<NodeSession> {
        let (node, created) = self.lookup_or_create(id);
        let previous = node.ip();
        match previous.as_deref() {
            Some(known) if known == ip => {
                info!("Existing node {} at {} was powered on again", id, ip);
                return node;
            }
            Some(known) => {
                warn!(
                    "Existing node {} has moved from IP address {} to {}",
                    id, known, ip
                );
            }
            None if created => info!("New node {} seen at IP address {}", id, ip),
            None => info!("Node {} seen at IP address {}", id, ip),
        }
        if let Some(other) = self.node_with_ip(ip, Some(id)) {
            warn!("Another node {} is already using IP address {}", other, ip);
        }
        node.relocate(ip);
        node
    }

    /// Handle a power-on report: record the sighting and turn the node on
    pub fn node_on(
        &self,
        id: NodeId,
        ip: &str,
        mac: &str,
        when: Timestamp,
        main_conn: Option<Arc<dyn LineSink>>,
    ) -> Arc<NodeSession> {
        let node = self.record_sighting(id, ip);
        node.turn_on(mac, when, main_conn);
        node
    }

    /// Check a message claiming to be from node `id` at `ip`
    ///
    /// Unknown nodes are added rather than rejected. A node that was never
    /// seen powering on is assumed to be on. Any AWOL status is cleared.
    pub fn verify(&self, id: NodeId, ip: &str, when: Timestamp) -> Arc<NodeSession> {
        let node = match self.get(id) {
            Some(node) => node,
            None => {
                warn!(
                    "Message from {} claims to be from node {}, which is not in the list; adding it",
                    ip, id
                );
                self.record_sighting(id, ip)
            }
        };
        match node.ip() {
            Some(known) if known == ip => {}
            Some(known) => {
                warn!(
                    "Message from {} claims to be from node {}, but that node was at {}; moving it",
                    ip, id, known
                );
                node.relocate(ip);
            }
            None => node.relocate(ip),
        }
        if node.assume_on() {
            warn!(
                "Message from node {} at {} arrived before its power-on message",
                id, ip
            );
        }
        node.saw_at(when);
        node
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by_key(|n| n.id());
        nodes.iter().map(|n| n.snapshot()).collect()
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.iter().filter(|n| n.status() == status).count()
    }

    /// Stop every node's background work and join it
    pub fn shutdown(&self, deadline: Instant) -> bool {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        for node in &nodes {
            node.stop();
        }
        let mut clean = true;
        for node in &nodes {
            clean &= node.join_until(deadline);
        }
        clean
    }
}

impl fmt::Display for SensorNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for snap in self.snapshots() {
            writeln!(
                f,
                "node {:>2}  {:<15}  {:<12}  bridge {:<11}  host {}",
                snap.id,
                snap.ip.as_deref().unwrap_or("-"),
                snap.status.to_string(),
                snap.bridge_mode,
                snap.host_type
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::context;
    use crate::types::now;

    #[test]
    fn test_lookup_or_create_is_stable() {
        let net = SensorNet::new(context().ctx);
        let (a, created) = net.lookup_or_create(3);
        assert!(created);
        let (b, created) = net.lookup_or_create(3);
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.status(), NodeStatus::Unseen);
    }

    #[test]
    fn test_sighting_last_writer_wins() {
        let net = SensorNet::new(context().ctx);
        net.record_sighting(1, "10.0.0.5");
        net.record_sighting(2, "10.0.0.5");
        assert_eq!(net.get(1).unwrap().ip().as_deref(), Some("10.0.0.5"));
        assert_eq!(net.get(2).unwrap().ip().as_deref(), Some("10.0.0.5"));
        assert_eq!(net.node_with_ip("10.0.0.5", Some(2)), Some(1));

        net.record_sighting(1, "10.0.0.9");
        assert_eq!(net.get(1).unwrap().ip().as_deref(), Some("10.0.0.9"));
        assert_eq!(net.node_with_ip("10.0.0.5", None), Some(2));
    }

    #[test]
    fn test_verify_unknown_node_is_added_and_on() {
        let net = SensorNet::new(context().ctx);
        let node = net.verify(7, "10.0.0.7", now());
        assert_eq!(node.status(), NodeStatus::On);
        assert_eq!(node.ip().as_deref(), Some("10.0.0.7"));
        assert_eq!(net.ids(), vec![7]);
    }

    #[test]
    fn test_verify_clears_awol() {
        let net = SensorNet::new(context().ctx);
        let node = net.node_on(1, "10.0.0.1", "aa:bb", now(), None);
        node.mark_awol();
        assert_eq!(node.status(), NodeStatus::OnAwol);
        net.verify(1, "10.0.0.1", now());
        assert_eq!(node.status(), NodeStatus::On);
    }

    #[test]
    fn test_verify_moves_node_to_new_ip() {
        let net = SensorNet::new(context().ctx);
        net.node_on(1, "10.0.0.1", "aa:bb", now(), None);
        net.verify(1, "10.0.0.2", now());
        assert_eq!(net.get(1).unwrap().ip().as_deref(), Some("10.0.0.2"));
        assert_eq!(net.count_with_status(NodeStatus::On), 1);
    }
}
