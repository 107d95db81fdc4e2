//! Cluster protocol module.
//!
//! Provides domain types, collaborator traits, the per-connection protocol
//! machine, heartbeat failure detection, elections and auctions, and the
//! shared state that ties them to the peer registry and the message store.

pub mod election;
pub mod failure_detector;
pub mod protocol;
pub mod state;
pub mod traits;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports (flat public API)
// ---------------------------------------------------------------------------

// types
pub use types::{
    AuctionOutcome, BidOutcome, ClusterHealth, CloseReason, ConnectionId, ConnectionState,
    ElectionResult, NodeInfo, Redistribution, Voter,
};

// traits
pub use traits::{BidSource, DeliveryClient, RandomBids, StatusEvent};

// protocol
pub use protocol::{ConnectionMachine, ProtocolError, ProtocolEvent, Step};

// election
pub use election::{resolve_bid, seeded_rng, Election, ElectionError};

// state
pub use state::{ClusterChange, ClusterState};

// failure_detector
pub use failure_detector::{HeartbeatState, ProbeVerdict};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::{Message, NodeId, WireMessage};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::config::{ClusterConfig, ConnectionConfig, StorageConfig};
    use crate::network::connection::{Direction, PeerHandle};
    use crate::network::transport::spawn_peer;
    use crate::storage::{MessageLog, MessageStore};

    struct Node {
        cluster: Arc<ClusterState>,
        changes: mpsc::UnboundedReceiver<ClusterChange>,
        _dir: TempDir,
    }

    impl Node {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MessageLog::open(&StorageConfig {
                message_log: dir.path().join("messages.log"),
                owner_log: dir.path().join("owners.log"),
                ..StorageConfig::default()
            }));
            let (cluster, changes) = ClusterState::new(
                Uuid::new_v4(),
                ClusterConfig::default(),
                ConnectionConfig::default(),
                store,
            );
            Self {
                cluster: Arc::new(cluster),
                changes,
                _dir: dir,
            }
        }

        fn id(&self) -> NodeId {
            self.cluster.local()
        }

        fn store(&self) -> &MessageLog {
            self.cluster.store()
        }

        fn drain_changes(&mut self) -> Vec<ClusterChange> {
            let mut changes = Vec::new();
            while let Ok(change) = self.changes.try_recv() {
                changes.push(change);
            }
            changes
        }
    }

    /// Connects `from` to `to` over an in-memory stream; returns both ends.
    async fn link(from: &Node, to: &Node, catch_up: bool) -> (Arc<PeerHandle>, Arc<PeerHandle>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let dialed = spawn_peer(a, "duplex", Direction::Outbound, Arc::clone(&from.cluster));
        let accepted = spawn_peer(b, "duplex", Direction::Inbound, Arc::clone(&to.cluster));
        from.cluster.open_session(&dialed, catch_up).await;
        (dialed, accepted)
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn established(handle: &PeerHandle) {
        eventually("session", || {
            handle.partner().is_some() && handle.state() == ConnectionState::General
        })
        .await;
    }

    #[tokio::test]
    async fn dead_node_messages_move_to_one_survivor() {
        let (mut a, mut b, mut c) = (Node::new(), Node::new(), Node::new());
        let (ab, ba) = link(&a, &b, false).await;
        let (ac, ca) = link(&a, &c, false).await;
        let (bc, cb) = link(&b, &c, false).await;
        for handle in [&ab, &ba, &ac, &ca, &bc, &cb] {
            established(handle).await;
        }

        // submit M on A and replicate the creation
        let m = Message::new("http://origin/status", "http://target/in", b"hi".to_vec());
        a.store().add_message(m.clone(), a.id()).unwrap();
        assert_eq!(a.cluster.broadcast(&WireMessage::MessageCreated(m.clone())), 2);
        eventually("replication", || {
            b.store().owner_of(m.id) == Some(a.id()) && c.store().owner_of(m.id) == Some(a.id())
        })
        .await;
        assert_eq!(a.store().owner_of(m.id), Some(a.id()));
        b.drain_changes();
        c.drain_changes();

        // both survivors lose A to a heartbeat timeout
        b.cluster.close_peer(&ba, CloseReason::HeartbeatTimeout);
        c.cluster.close_peer(&ca, CloseReason::HeartbeatTimeout);

        let mut survivors = vec![b.id(), c.id()];
        survivors.sort_unstable();
        for node in [&mut b, &mut c] {
            let changes = node.drain_changes();
            assert!(changes.contains(&ClusterChange::ElectionStarted {
                dead_node: a.id(),
                voters: survivors.clone(),
            }));
            assert!(changes
                .iter()
                .any(|change| matches!(change, ClusterChange::MessagesRedistributed(r) if r.dead_node == a.id())));
        }

        let new_owner = b.store().owner_of(m.id).unwrap();
        assert!(survivors.contains(&new_owner));
        assert_eq!(c.store().owner_of(m.id), Some(new_owner));
        assert!(b.store().messages_owned_by(a.id()).is_empty());
        drop((ab, ac, bc, cb));
    }

    #[tokio::test]
    async fn fresh_node_catches_up_then_joins() {
        let veteran = Node::new();
        let fresh = Node::new();
        let known: Vec<Message> = (0..4)
            .map(|i| Message::new("s", "d", vec![i; 8]))
            .collect();
        for m in &known {
            veteran.store().add_message(m.clone(), veteran.id()).unwrap();
        }

        let (dialed, accepted) = link(&fresh, &veteran, true).await;
        established(&dialed).await;
        established(&accepted).await;

        for m in &known {
            assert!(fresh.store().message(m.id).unwrap().unwrap().content_eq(m));
            assert_eq!(fresh.store().owner_of(m.id), Some(veteran.id()));
        }
        assert_eq!(dialed.partner(), Some(veteran.id()));
        assert_eq!(accepted.partner(), Some(fresh.id()));
    }

    #[tokio::test]
    async fn orphan_auction_settles_ownership_on_both_sides() {
        let (a, b) = (Node::new(), Node::new());
        let (ab, ba) = link(&a, &b, false).await;
        established(&ab).await;
        established(&ba).await;

        let gone = Uuid::new_v4();
        let orphans: Vec<Message> = (0..5).map(|i| Message::new("s", "d", vec![i])).collect();
        for m in &orphans {
            a.store().add_message(m.clone(), gone).unwrap();
        }

        let settled = a.cluster.auction_orphans().await;
        assert_eq!(settled.len(), orphans.len());
        for (id, owner) in &settled {
            assert!(*owner == a.id() || *owner == b.id());
            assert_eq!(a.store().owner_of(*id), Some(*owner));
        }
        eventually("peer agreement", || {
            settled
                .iter()
                .all(|(id, owner)| b.store().owner_of(*id) == Some(*owner))
        })
        .await;
        // B fetched the bodies of what it won
        eventually("bodies", || {
            settled
                .iter()
                .filter(|(_, owner)| *owner == b.id())
                .all(|(id, _)| b.store().contains_message(*id))
        })
        .await;
        assert_eq!(ab.state(), ConnectionState::General);
    }

    #[tokio::test]
    async fn delivered_notice_forgets_message_everywhere() {
        let (a, b) = (Node::new(), Node::new());
        let (ab, ba) = link(&a, &b, false).await;
        established(&ab).await;
        established(&ba).await;

        let m = Message::new("s", "d", b"done".to_vec());
        a.store().add_message(m.clone(), a.id()).unwrap();
        a.cluster.broadcast(&WireMessage::MessageCreated(m.clone()));
        eventually("replication", || b.store().contains_message(m.id)).await;

        a.store().forget(m.id);
        a.cluster.broadcast(&WireMessage::MessageDelivered(m.id));
        eventually("forget", || {
            !b.store().contains_message(m.id) && b.store().owner_of(m.id).is_none()
        })
        .await;
    }
}
