//! Cluster domain types shared by the protocol, the election engine and the
//! peer registry.

use std::fmt;
use std::time::Duration;

use courier_core::{MessageId, NodeId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Per-connection protocol state.
///
/// `Start` is initial; `Auction` and `NewNode` are sub-dialogs entered from
/// `General` and `Start` respectively. `ERROR`/`TIMEOUT` return any state to
/// `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Start,
    General,
    Auction,
    NewNode,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "START",
            Self::General => "GENERAL",
            Self::Auction => "AUCTION",
            Self::NewNode => "NEW_NODE",
        })
    }
}

/// Outcome of tallying an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElectionResult {
    /// At least one voter has not voted.
    StillTallying,
    /// Two or more voters share the highest vote.
    Tie,
    /// Exactly one voter holds the highest vote.
    LeaderElected,
}

/// Comparison of one bid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidOutcome {
    Won,
    Lost,
    Tie,
}

/// How a contested message settled for the local side of an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuctionOutcome {
    Won,
    Lost,
    /// The peer's bid never arrived; the message stays here.
    TimedOut,
}

/// Why a peer connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// A heartbeat probe went unanswered. Starts dead-node handling.
    HeartbeatTimeout,
    /// Reset, EOF or another I/O failure.
    Transport,
    /// This node is shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub fn declares_dead(self) -> bool {
        matches!(self, Self::HeartbeatTimeout)
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One participant of an election and its vote, if cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voter {
    pub node: NodeId,
    pub vote: Option<i32>,
}

/// Point-in-time view of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub connection: ConnectionId,
    /// UUID the peer announced, once known.
    pub partner: Option<NodeId>,
    pub address: String,
    pub connected: bool,
    pub state: ConnectionState,
    /// Time since the last line was received.
    pub idle: Duration,
    /// A `HEART BEAT START` is waiting for its answer.
    pub awaiting_heartbeat: bool,
}

/// Counts exposed to the status layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    pub connected_peers: usize,
    pub identified_peers: usize,
    pub messages: usize,
    pub owned_messages: usize,
}

/// Result of redistributing a dead node's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redistribution {
    pub dead_node: NodeId,
    pub leader: NodeId,
    /// `(message, new owner)` for every message the dead node owned.
    pub assignments: Vec<(MessageId, NodeId)>,
}
