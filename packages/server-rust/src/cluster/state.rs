//! Shared cluster state.
//!
//! [`ClusterState`] is the node-wide context every connection task holds:
//! the local node ID, timing configuration, the message store, the peer
//! registry and the set of nodes already declared dead. It applies the
//! protocol machine's events, runs dead-node elections and orphan auctions,
//! and reports what happened through [`ClusterChange`] events.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use courier_core::{MessageId, NodeId, WireMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::election::{seeded_rng, Election};
use super::protocol::{ConnectionMachine, ProtocolEvent, Step};
use super::types::{
    AuctionOutcome, ClusterHealth, CloseReason, ConnectionId, ConnectionState, NodeInfo,
    Redistribution,
};
use crate::config::{ClusterConfig, ConnectionConfig};
use crate::network::connection::{Direction, PeerHandle, PeerRegistry};
use crate::storage::{MessageLog, MessageStore};

// ---------------------------------------------------------------------------
// ClusterChange
// ---------------------------------------------------------------------------

/// Events emitted when cluster membership or ownership changes.
///
/// Subscribers receive these via an unbounded mpsc channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterChange {
    PeerConnected {
        connection: ConnectionId,
        address: String,
    },
    PeerIdentified {
        connection: ConnectionId,
        node: NodeId,
    },
    PeerDisconnected {
        connection: ConnectionId,
        node: Option<NodeId>,
        reason: CloseReason,
    },
    ElectionStarted {
        dead_node: NodeId,
        voters: Vec<NodeId>,
    },
    LeaderElected {
        dead_node: NodeId,
        leader: NodeId,
    },
    MessagesRedistributed(Redistribution),
    /// Orphaned messages settled; `(message, new owner)`.
    OrphansSettled(Vec<(MessageId, NodeId)>),
}

// ---------------------------------------------------------------------------
// ClusterState
// ---------------------------------------------------------------------------

pub struct ClusterState {
    local: NodeId,
    config: ClusterConfig,
    connection: ConnectionConfig,
    store: Arc<MessageLog>,
    registry: Arc<PeerRegistry>,
    /// Nodes whose messages were already redistributed.
    dead: Mutex<HashSet<NodeId>>,
    changes: mpsc::UnboundedSender<ClusterChange>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("local", &self.local)
            .field("peers", &self.registry.count())
            .field("dead", &self.dead.lock().len())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    /// Creates the context and the receiving end of its change stream.
    #[must_use]
    pub fn new(
        local: NodeId,
        config: ClusterConfig,
        connection: ConnectionConfig,
        store: Arc<MessageLog>,
    ) -> (Self, mpsc::UnboundedReceiver<ClusterChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let state = Self {
            local,
            config,
            connection,
            store,
            registry: Arc::new(PeerRegistry::new()),
            dead: Mutex::new(HashSet::new()),
            changes,
        };
        (state, rx)
    }

    #[must_use]
    pub fn local(&self) -> NodeId {
        self.local
    }

    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[must_use]
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MessageLog> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// A fresh protocol machine for a new connection.
    #[must_use]
    pub fn new_machine(&self) -> ConnectionMachine {
        ConnectionMachine::new(self.local)
    }

    pub(crate) fn emit(&self, change: ClusterChange) {
        // Nobody listening is fine.
        let _ = self.changes.send(change);
    }

    /// Queues `message` on every identified peer. Returns how many peers
    /// accepted it.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        self.registry.broadcast(message)
    }

    #[must_use]
    pub fn health(&self) -> ClusterHealth {
        ClusterHealth {
            connected_peers: self.registry.count(),
            identified_peers: self.registry.identified_nodes().len(),
            messages: self.store.message_count(),
            owned_messages: self.store.messages_owned_by(self.local).len(),
        }
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.registry
            .connections()
            .iter()
            .map(|handle| handle.info())
            .collect()
    }

    #[must_use]
    pub fn is_dead(&self, node: NodeId) -> bool {
        self.dead.lock().contains(&node)
    }

    // -----------------------------------------------------------------------
    // Driving a connection
    // -----------------------------------------------------------------------

    /// Runs one transition on `handle`'s machine, queues its replies in order
    /// and applies its events.
    ///
    /// A transition that drops an established session back to START (peer
    /// `ERROR`, a violation, the end of catch-up) reopens it with `START`
    /// once the partner is known.
    pub async fn drive<F>(&self, handle: &Arc<PeerHandle>, transition: F)
    where
        F: FnOnce(&mut ConnectionMachine, &dyn MessageStore) -> Step + Send,
    {
        let events = {
            let mut machine = handle.machine.lock().await;
            let before = machine.state();
            let Step {
                mut replies,
                events,
            } = transition(&mut *machine, &*self.store);

            if before != ConnectionState::Start
                && machine.state() == ConnectionState::Start
                && machine.partner().is_some()
            {
                if let Ok(opening) = machine.begin_start() {
                    replies.extend(opening);
                }
            }
            handle.set_state(machine.state());

            if let Err(e) = handle.send_all(replies).await {
                warn!(connection = %handle.id, error = %e, "failed to queue replies");
                drop(machine);
                self.close_peer(handle, CloseReason::Transport);
                return;
            }
            events
        };
        self.apply_events(handle, events);
    }

    /// Opens a dialed connection: `START`, or `NEW NODE` when this node has
    /// nothing stored and wants to catch up.
    pub async fn open_session(&self, handle: &Arc<PeerHandle>, catch_up: bool) {
        let mut machine = handle.machine.lock().await;
        let opening = if catch_up {
            machine.begin_catch_up()
        } else {
            machine.begin_start()
        };
        let opening = match opening {
            Ok(lines) => lines,
            Err(e) => {
                warn!(connection = %handle.id, error = %e, "cannot open session");
                return;
            }
        };
        handle.set_state(machine.state());
        if let Err(e) = handle.send_all(opening).await {
            warn!(connection = %handle.id, error = %e, "failed to send session opening");
            drop(machine);
            self.close_peer(handle, CloseReason::Transport);
        }
    }

    fn apply_events(&self, handle: &Arc<PeerHandle>, events: Vec<ProtocolEvent>) {
        for event in events {
            match event {
                ProtocolEvent::PartnerIdentified(node) => self.on_identified(handle, node),
                ProtocolEvent::HeartbeatAnswered => {
                    handle.heartbeat.lock().record_reply(tokio::time::Instant::now());
                }
                ProtocolEvent::DeadNodeAnnounced(node) => self.on_dead_node_announced(node),
                ProtocolEvent::CatchUpFinished { messages, owners } => {
                    info!(connection = %handle.id, messages, owners, "catch-up finished");
                }
                ProtocolEvent::AuctionFinished(results) => {
                    if let Some(waiter) = handle.auction_waiter.lock().take() {
                        let _ = waiter.send(results);
                    }
                }
                ProtocolEvent::ProtocolViolation { .. } => {
                    metrics::counter!("courier_protocol_errors_total").increment(1);
                }
            }
        }
    }

    fn on_identified(&self, handle: &Arc<PeerHandle>, node: NodeId) {
        if node == self.local {
            warn!(connection = %handle.id, "peer announced our own node ID");
            return;
        }
        if handle.partner() == Some(node) {
            return;
        }
        handle.set_partner(node);
        for other in self.registry.connections() {
            if other.id == handle.id || other.partner() != Some(node) {
                continue;
            }
            if self.replaces(handle, &other, node) {
                info!(connection = %other.id, node = %node, "evicting stale connection");
                self.close_peer(&other, CloseReason::Transport);
            } else {
                info!(connection = %handle.id, node = %node, "dropping crossed connection");
                self.close_peer(handle, CloseReason::Transport);
                other.probe.notify_one();
                return;
            }
        }
        if self.dead.lock().remove(&node) {
            info!(node = %node, "previously dead node is back");
        }
        info!(connection = %handle.id, node = %node, "peer identified");
        self.emit(ClusterChange::PeerIdentified {
            connection: handle.id,
            node,
        });
    }

    /// Whether `fresh` takes over from `existing`, both connected to `node`.
    /// A reconnect replaces the older connection. When both ends dialed at
    /// once, both keep the connection dialed by the lower node ID.
    fn replaces(&self, fresh: &PeerHandle, existing: &PeerHandle, node: NodeId) -> bool {
        if fresh.direction == existing.direction {
            return true;
        }
        (fresh.direction == Direction::Outbound) == (self.local < node)
    }

    /// Another node claims `node` died. Trust it only if we have no
    /// connection of our own to check.
    fn on_dead_node_announced(&self, node: NodeId) {
        if node == self.local {
            warn!("peer announced this node as dead");
            return;
        }
        if let Some(peer) = self.registry.find(node) {
            debug!(node = %node, connection = %peer.id, "dead-node claim, probing our connection");
            peer.probe.notify_one();
        } else {
            self.node_died(node);
        }
    }

    // -----------------------------------------------------------------------
    // Closing and dead-node handling
    // -----------------------------------------------------------------------

    /// Closes `handle` and deregisters it. Idempotent: only the first caller
    /// acts. A heartbeat timeout also declares the partner dead, unless
    /// another connection to it is still open, which is probed instead.
    pub fn close_peer(&self, handle: &Arc<PeerHandle>, reason: CloseReason) {
        if !handle.mark_closed() {
            return;
        }
        handle.cancel.cancel();
        self.registry.remove(handle.id);
        // dropping the waiter tells a pending orphan auction it failed
        handle.auction_waiter.lock().take();

        let partner = handle.partner();
        info!(connection = %handle.id, node = ?partner, ?reason, "peer connection closed");
        self.emit(ClusterChange::PeerDisconnected {
            connection: handle.id,
            node: partner,
            reason,
        });

        if let (true, Some(node)) = (reason.declares_dead(), partner) {
            match self.registry.find(node) {
                Some(other) => other.probe.notify_one(),
                None => {
                    self.node_died(node);
                }
            }
        }
    }

    /// Runs dead-node handling for `dead`: elects a leader among the
    /// surviving reachable nodes and redistributes every message `dead`
    /// owned. The leader draw is seeded from the dead node's ID and each
    /// message's new owner from the dead node and the message ID, so
    /// survivors with the same voters agree on both.
    ///
    /// Returns `None` when `dead` was already handled or is this node.
    pub fn node_died(&self, dead: NodeId) -> Option<Redistribution> {
        if dead == self.local {
            return None;
        }
        if !self.dead.lock().insert(dead) {
            debug!(node = %dead, "dead node already handled");
            return None;
        }
        metrics::counter!("courier_dead_nodes_total").increment(1);

        let survivors = self
            .registry
            .identified_nodes()
            .into_iter()
            .chain(std::iter::once(self.local));
        let mut election = Election::for_dead_node(dead, survivors);
        let voters = election.voter_ids();
        info!(node = %dead, voters = voters.len(), "node declared dead, starting election");
        self.emit(ClusterChange::ElectionStarted {
            dead_node: dead,
            voters,
        });

        let leader = match election.elect(&mut seeded_rng(dead)) {
            Ok(leader) => leader,
            Err(e) => {
                error!(node = %dead, error = %e, "election failed");
                return None;
            }
        };
        self.emit(ClusterChange::LeaderElected {
            dead_node: dead,
            leader,
        });
        if leader == self.local {
            let told = self.broadcast(&WireMessage::DeadNode(dead));
            debug!(node = %dead, peers = told, "announced dead node as leader");
        }

        let assignments = match election.divide_up_nodes_messages(&*self.store) {
            Ok(assignments) => assignments,
            Err(e) => {
                error!(node = %dead, error = %e, "failed to redistribute messages");
                return None;
            }
        };
        info!(
            node = %dead,
            leader = %leader,
            messages = assignments.len(),
            "redistributed dead node's messages"
        );
        let redistribution = Redistribution {
            dead_node: dead,
            leader,
            assignments,
        };
        self.emit(ClusterChange::MessagesRedistributed(redistribution.clone()));
        Some(redistribution)
    }

    // -----------------------------------------------------------------------
    // Auctions
    // -----------------------------------------------------------------------

    /// Contests `messages` with one peer. Returns `None` when the peer is
    /// busy with another dialog or the connection failed.
    pub async fn auction_with(
        &self,
        peer: &Arc<PeerHandle>,
        about: NodeId,
        messages: Vec<MessageId>,
    ) -> Option<Vec<(MessageId, AuctionOutcome)>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut machine = peer.machine.lock().await;
            let opening = match machine.begin_auction(about, messages) {
                Ok(lines) => lines,
                Err(e) => {
                    debug!(connection = %peer.id, error = %e, "peer not ready for an auction");
                    return None;
                }
            };
            *peer.auction_waiter.lock() = Some(tx);
            peer.set_state(machine.state());
            if let Err(e) = peer.send_all(opening).await {
                warn!(connection = %peer.id, error = %e, "failed to open auction");
                drop(machine);
                self.close_peer(peer, CloseReason::Transport);
                return None;
            }
        }
        peer.rearm.notify_one();
        rx.await.ok()
    }

    /// Settles every message whose owner is neither this node nor a
    /// connected peer. Each group is auctioned with every identified peer in
    /// turn; a message lost to a peer goes to that peer, anything kept
    /// against every peer ends up owned here. Messages an auction did not
    /// settle (the peer was busy or gave the dialog up) stay orphaned until
    /// the next scan.
    pub async fn auction_orphans(&self) -> Vec<(MessageId, NodeId)> {
        let connected: BTreeSet<NodeId> = self.registry.identified_nodes().into_iter().collect();
        let mut orphans: BTreeMap<NodeId, Vec<MessageId>> = BTreeMap::new();
        for (id, owner) in self.store.ownership() {
            if owner != self.local && !connected.contains(&owner) {
                orphans.entry(owner).or_default().push(id);
            }
        }
        if orphans.is_empty() {
            return Vec::new();
        }

        let mut settled = Vec::new();
        let mut deferred = 0;
        for (about, ids) in orphans {
            debug!(owner = %about, messages = ids.len(), "auctioning orphaned messages");
            let mut remaining: BTreeSet<MessageId> = ids.into_iter().collect();
            let mut unsettled = BTreeSet::new();
            for peer in self.registry.identified_peers() {
                let contested: Vec<MessageId> = remaining.difference(&unsettled).copied().collect();
                if contested.is_empty() {
                    break;
                }
                let Some(partner) = peer.partner() else {
                    continue;
                };
                let Some(results) = self.auction_with(&peer, about, contested.clone()).await else {
                    unsettled.extend(contested);
                    continue;
                };
                let covered: BTreeSet<MessageId> = results.iter().map(|(id, _)| *id).collect();
                unsettled.extend(contested.into_iter().filter(|id| !covered.contains(id)));
                for (id, outcome) in results {
                    if outcome == AuctionOutcome::Lost && remaining.remove(&id) {
                        settled.push((id, partner));
                    }
                }
            }
            for id in remaining {
                if unsettled.contains(&id) {
                    deferred += 1;
                    continue;
                }
                if let Err(e) = self.store.set_owner(id, self.local) {
                    error!(message = %id, error = %e, "failed to take orphaned message");
                    continue;
                }
                settled.push((id, self.local));
            }
        }

        settled.sort_unstable();
        info!(messages = settled.len(), deferred, "settled orphaned messages");
        self.emit(ClusterChange::OrphansSettled(settled.clone()));
        settled
    }

    /// Closes every connection without declaring anyone dead.
    pub fn shutdown(&self) {
        for handle in self.registry.drain_all() {
            if handle.mark_closed() {
                handle.request_close();
                self.emit(ClusterChange::PeerDisconnected {
                    connection: handle.id,
                    node: handle.partner(),
                    reason: CloseReason::Shutdown,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
