//! Peer connection handles and the node registry.
//!
//! Provides per-connection backpressure via bounded mpsc channels, lock-free
//! concurrent peer tracking via `DashMap`, and the per-connection protocol
//! machine and heartbeat state the transport drives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use courier_core::{MessageId, NodeId, WireMessage};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cluster::failure_detector::HeartbeatState;
use crate::cluster::protocol::ConnectionMachine;
use crate::cluster::types::{AuctionOutcome, ConnectionId, ConnectionState, NodeInfo};
use crate::config::ConnectionConfig;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Item queued for a connection's write loop.
#[derive(Debug)]
pub enum OutboundMessage {
    Line(WireMessage),
    /// Flush what is queued, then close the stream.
    Close,
}

/// Error returned when queueing a line for a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The channel stayed full for the whole send timeout.
    #[error("send timed out")]
    Timeout,
    /// The write loop has exited.
    #[error("connection closed")]
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    #[error("outbound channel full")]
    Full,
}

pub(crate) type AuctionWaiter = oneshot::Sender<Vec<(MessageId, AuctionOutcome)>>;

/// Handle to a single peer connection.
///
/// The receiver end of `tx` is held by the write loop; everything else here
/// is shared between the read loop, the heartbeat task and the node-level
/// tasks that open dialogs on this connection.
pub struct PeerHandle {
    pub id: ConnectionId,
    /// Remote socket address, or a label for in-process streams.
    pub address: String,
    pub direction: Direction,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundMessage>,
    send_timeout: Duration,
    /// Locked across a transition and the sends of its replies, so the lines
    /// of one step are queued contiguously.
    pub(crate) machine: tokio::sync::Mutex<ConnectionMachine>,
    pub(crate) heartbeat: Mutex<HeartbeatState>,
    partner: RwLock<Option<NodeId>>,
    state: ArcSwap<ConnectionState>,
    pub(crate) cancel: CancellationToken,
    closed: AtomicBool,
    /// Wakes the heartbeat task for an immediate probe.
    pub(crate) probe: Notify,
    /// Wakes the read loop to re-arm its deadline after a local dialog start.
    pub(crate) rearm: Notify,
    pub(crate) auction_waiter: Mutex<Option<AuctionWaiter>>,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("partner", &self.partner())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Attempts to queue a line without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] or [`SendError::Disconnected`].
    pub fn try_send(&self, message: WireMessage) -> Result<(), SendError> {
        self.tx
            .try_send(OutboundMessage::Line(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
            })
    }

    /// Queues a line, waiting up to the configured send timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Timeout`] if the channel remains full, or
    /// [`SendError::Disconnected`] if the write loop has exited.
    pub async fn send(&self, message: WireMessage) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_timeout, self.tx.send(OutboundMessage::Line(message)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Queues every line in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`SendError`].
    pub async fn send_all(&self, messages: Vec<WireMessage>) -> Result<(), SendError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Asks the write loop to close after flushing.
    pub fn request_close(&self) {
        if self.tx.try_send(OutboundMessage::Close).is_err() {
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.closed.load(Ordering::Acquire)
    }

    /// Marks the handle closed. Returns `true` for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn partner(&self) -> Option<NodeId> {
        *self.partner.read()
    }

    pub(crate) fn set_partner(&self, node: NodeId) {
        *self.partner.write() = Some(node);
    }

    /// Protocol state as of the last completed transition.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(Arc::new(state));
    }

    #[must_use]
    pub fn info(&self) -> NodeInfo {
        let heartbeat = self.heartbeat.lock();
        NodeInfo {
            connection: self.id,
            partner: self.partner(),
            address: self.address.clone(),
            connected: self.is_connected(),
            state: self.state(),
            idle: heartbeat.idle(tokio::time::Instant::now()),
            awaiting_heartbeat: heartbeat.awaiting_reply(),
        }
    }
}

/// Thread-safe registry of every live peer connection.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<ConnectionId, Arc<PeerHandle>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the receiver the
    /// write loop drains.
    pub fn register(
        &self,
        address: impl Into<String>,
        direction: Direction,
        machine: ConnectionMachine,
        config: &ConnectionConfig,
    ) -> (Arc<PeerHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(PeerHandle {
            id,
            address: address.into(),
            direction,
            connected_at: Instant::now(),
            tx,
            send_timeout: config.send_timeout,
            machine: tokio::sync::Mutex::new(machine),
            heartbeat: Mutex::new(HeartbeatState::new(tokio::time::Instant::now())),
            partner: RwLock::new(None),
            state: ArcSwap::from_pointee(ConnectionState::Start),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            probe: Notify::new(),
            rearm: Notify::new(),
            auction_waiter: Mutex::new(None),
        });

        self.peers.insert(id, Arc::clone(&handle));
        record_peer_count(self.peers.len());
        (handle, rx)
    }

    /// Removes a connection, returning its handle if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<PeerHandle>> {
        let removed = self.peers.remove(&id).map(|(_, handle)| handle);
        record_peer_count(self.peers.len());
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<PeerHandle>> {
        self.peers.get(&id).map(|r| r.value().clone())
    }

    /// Live connection to `node`. While a reconnect is being settled the
    /// older of the two is returned.
    pub fn find(&self, node: NodeId) -> Option<Arc<PeerHandle>> {
        self.peers
            .iter()
            .filter(|entry| entry.value().partner() == Some(node))
            .min_by_key(|entry| *entry.key())
            .map(|entry| entry.value().clone())
    }

    /// Distinct node IDs announced by live connections, sorted.
    #[must_use]
    pub fn identified_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .peers
            .iter()
            .filter_map(|entry| entry.value().partner())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// One connection per identified node, ordered by node ID.
    #[must_use]
    pub fn identified_peers(&self) -> Vec<Arc<PeerHandle>> {
        self.identified_nodes()
            .into_iter()
            .filter_map(|node| self.find(node))
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<PeerHandle>> {
        let mut all: Vec<_> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|handle| handle.id);
        all
    }

    /// Queues `message` on every identified connection.
    ///
    /// Uses non-blocking `try_send` so one slow peer cannot stall the
    /// broadcast; full channels are skipped with a warning.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let mut sent = 0;
        for entry in &self.peers {
            let handle = entry.value();
            if handle.partner().is_none() {
                continue;
            }
            match handle.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    connection = %handle.id,
                    keyword = message.keyword(),
                    error = %e,
                    "broadcast skipped peer"
                ),
            }
        }
        sent
    }

    /// Removes and returns every connection. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<PeerHandle>> {
        let keys: Vec<ConnectionId> = self.peers.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.peers.remove(&key) {
                handles.push(handle);
            }
        }
        record_peer_count(0);
        handles
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_peer_count(count: usize) {
    metrics::gauge!("courier_peers_connected").set(count as f64);
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
