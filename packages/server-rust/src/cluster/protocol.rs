//! Per-connection protocol state machine.
//!
//! [`ConnectionMachine`] holds no socket. Each inbound [`WireMessage`] goes
//! through [`ConnectionMachine::handle`] together with the shared store; the
//! returned [`Step`] carries the lines to send back, in order, and the events
//! the transport must act on. Every ownership write and every received body
//! reaches the store before `handle` returns.

use std::collections::HashMap;

use courier_core::{Message, MessageId, NodeId, WireMessage};
use tracing::{debug, error, trace, warn};

use super::election::resolve_bid;
use super::traits::{BidSource, RandomBids};
use super::types::{AuctionOutcome, BidOutcome, ConnectionState};
use crate::storage::{MessageStore, StoreError};

/// A local request to open a dialog in the wrong state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot {action} while in state {state}")]
    WrongState {
        action: &'static str,
        state: ConnectionState,
    },
}

/// Something the transport has to do beyond sending replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The peer announced its node ID.
    PartnerIdentified(NodeId),
    /// Our `HEART BEAT START` was answered.
    HeartbeatAnswered,
    /// The peer claims `node` is dead.
    DeadNodeAnnounced(NodeId),
    /// We received the full catch-up stream and are back in START.
    CatchUpFinished { messages: usize, owners: usize },
    /// An auction we initiated closed. Outcomes cover every settled message.
    AuctionFinished(Vec<(MessageId, AuctionOutcome)>),
    /// The peer sent something the current state does not accept.
    ProtocolViolation { state: ConnectionState, received: String },
}

/// Output of one transition.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    pub replies: Vec<WireMessage>,
    pub events: Vec<ProtocolEvent>,
}

impl Step {
    fn reply(message: WireMessage) -> Self {
        Self {
            replies: vec![message],
            events: Vec::new(),
        }
    }

    fn event(event: ProtocolEvent) -> Self {
        Self {
            replies: Vec::new(),
            events: vec![event],
        }
    }
}

// ---------------------------------------------------------------------------
// Dialog bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug)]
struct AuctionSession {
    role: Role,
    /// Node whose messages are contested.
    about: NodeId,
    /// Initiator only: the peer has not echoed `AUCTION` yet.
    awaiting_ack: bool,
    /// Initiator only: messages to bid on once acknowledged.
    queue: Vec<MessageId>,
    /// Our outstanding bids, waiting for the peer's value.
    pending: HashMap<MessageId, i32>,
    results: Vec<(MessageId, AuctionOutcome)>,
    /// Initiator only: `AUCTION OVER` has been sent.
    closing: bool,
}

impl AuctionSession {
    fn settled(&self) -> bool {
        !self.awaiting_ack && self.queue.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatchUp {
    Requester { received: usize, owners: usize },
    Responder,
}

// ---------------------------------------------------------------------------
// ConnectionMachine
// ---------------------------------------------------------------------------

pub struct ConnectionMachine {
    local: NodeId,
    state: ConnectionState,
    partner: Option<NodeId>,
    start_sent: bool,
    auction: Option<AuctionSession>,
    catch_up: Option<CatchUp>,
    bids: Box<dyn BidSource>,
    tie_retries: u64,
}

impl std::fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("local", &self.local)
            .field("state", &self.state)
            .field("partner", &self.partner)
            .field("auction", &self.auction)
            .field("catch_up", &self.catch_up)
            .finish_non_exhaustive()
    }
}

impl ConnectionMachine {
    #[must_use]
    pub fn new(local: NodeId) -> Self {
        Self::with_bids(local, Box::new(RandomBids::new()))
    }

    #[must_use]
    pub fn with_bids(local: NodeId, bids: Box<dyn BidSource>) -> Self {
        Self {
            local,
            state: ConnectionState::Start,
            partner: None,
            start_sent: false,
            auction: None,
            catch_up: None,
            bids,
            tie_retries: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn partner(&self) -> Option<NodeId> {
        self.partner
    }

    /// Number of times this side redrew after a tied bid.
    #[must_use]
    pub fn tie_retries(&self) -> u64 {
        self.tie_retries
    }

    /// True while the next read should be bounded by the bid timeout: an
    /// auction we opened waits for an acknowledgement, a bid, or the closing
    /// `AUCTION OVER`.
    #[must_use]
    pub fn awaiting_bid(&self) -> bool {
        self.auction.as_ref().is_some_and(|s| {
            s.role == Role::Initiator && (s.closing || s.awaiting_ack || !s.pending.is_empty())
        })
    }

    // -----------------------------------------------------------------------
    // Locally initiated dialogs
    // -----------------------------------------------------------------------

    /// Opens the session: `START <our-uuid>`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::WrongState`] outside START.
    pub fn begin_start(&mut self) -> Result<Vec<WireMessage>, ProtocolError> {
        self.expect_state(ConnectionState::Start, "send START")?;
        self.start_sent = true;
        Ok(vec![WireMessage::Start(Some(self.local))])
    }

    /// Asks the peer for every message it knows: `NEW NODE <our-uuid>`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::WrongState`] outside START.
    pub fn begin_catch_up(&mut self) -> Result<Vec<WireMessage>, ProtocolError> {
        self.expect_state(ConnectionState::Start, "request catch-up")?;
        self.state = ConnectionState::NewNode;
        self.catch_up = Some(CatchUp::Requester {
            received: 0,
            owners: 0,
        });
        Ok(vec![WireMessage::NewNode(self.local)])
    }

    /// Contests `messages` (last owned by `about`) with the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::WrongState`] outside GENERAL.
    pub fn begin_auction(
        &mut self,
        about: NodeId,
        messages: Vec<MessageId>,
    ) -> Result<Vec<WireMessage>, ProtocolError> {
        self.expect_state(ConnectionState::General, "start an auction")?;
        self.state = ConnectionState::Auction;
        self.auction = Some(AuctionSession {
            role: Role::Initiator,
            about,
            awaiting_ack: true,
            queue: messages,
            pending: HashMap::new(),
            results: Vec::new(),
            closing: false,
        });
        Ok(vec![WireMessage::Auction(about)])
    }

    fn expect_state(
        &self,
        expected: ConnectionState,
        action: &'static str,
    ) -> Result<(), ProtocolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::WrongState {
                action,
                state: self.state,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Applies one inbound message.
    pub fn handle(&mut self, message: WireMessage, store: &dyn MessageStore) -> Step {
        trace!(state = %self.state, received = message.keyword(), "protocol input");
        match message {
            WireMessage::HeartBeatStart => Step::reply(WireMessage::HeartBeat),
            WireMessage::HeartBeat => Step::event(ProtocolEvent::HeartbeatAnswered),
            WireMessage::Error | WireMessage::Timeout => {
                debug!(state = %self.state, received = message.keyword(), "peer reset the dialog");
                Step {
                    replies: Vec::new(),
                    events: self.reset(),
                }
            }
            // Replication notices are broadcast without regard to the
            // receiver's dialog, so every state accepts them.
            WireMessage::MessageCreated(created) => self.on_created(created, store),
            WireMessage::MessageDelivered(id) => {
                store.forget(id);
                Step::default()
            }
            WireMessage::DeadNode(node) => Step::event(ProtocolEvent::DeadNodeAnnounced(node)),
            other => match self.state {
                ConnectionState::Start => self.on_start(other, store),
                ConnectionState::General => self.on_general(other, store),
                ConnectionState::Auction => self.on_auction(other, store),
                ConnectionState::NewNode => self.on_new_node(other, store),
            },
        }
    }

    /// Answers a line that did not parse: `ERROR`, back to START.
    pub fn reject(&mut self, line: &str) -> Step {
        self.violation(line.to_string())
    }

    /// The bid read timed out: keep every contested message and close the
    /// auction. A second expiry while closing gives up with `TIMEOUT`.
    pub fn expire_bids(&mut self, store: &dyn MessageStore) -> Step {
        let local = self.local;
        let Some(session) = self.auction.as_mut() else {
            return Step::default();
        };
        if session.closing {
            warn!(peer = ?self.partner, "auction close was never acknowledged");
            return Step {
                replies: vec![WireMessage::Timeout],
                events: self.reset(),
            };
        }
        let mut expired: Vec<MessageId> = session.pending.drain().map(|(id, _)| id).collect();
        expired.append(&mut session.queue);
        session.awaiting_ack = false;
        expired.sort_unstable();

        for id in expired {
            if let Err(e) = store.set_owner(id, local) {
                return self.store_failure(&e);
            }
            warn!(message = %id, "bid reply timed out, keeping message");
            session.results.push((id, AuctionOutcome::TimedOut));
        }

        let mut step = Step::default();
        if session.role == Role::Initiator && !session.closing {
            session.closing = true;
            step.replies.push(WireMessage::AuctionOver);
        }
        step
    }

    fn on_start(&mut self, message: WireMessage, store: &dyn MessageStore) -> Step {
        match message {
            WireMessage::Start(partner) => {
                let mut step = Step::default();
                if let Some(p) = partner {
                    self.partner = Some(p);
                    step.events.push(ProtocolEvent::PartnerIdentified(p));
                }
                if !self.start_sent {
                    step.replies.push(WireMessage::Start(Some(self.local)));
                }
                self.start_sent = false;
                self.state = ConnectionState::General;
                step
            }
            WireMessage::NewNode(node) => {
                let messages = match store.all_messages() {
                    Ok(messages) => messages,
                    Err(e) => return self.store_failure(&e),
                };
                let owners = store.ownership();
                self.partner = Some(node);
                self.state = ConnectionState::NewNode;
                self.catch_up = Some(CatchUp::Responder);
                debug!(
                    peer = %node,
                    messages = messages.len(),
                    owners = owners.len(),
                    "streaming catch-up"
                );

                // bodies first, so every ownership record names a stored message
                let mut replies = Vec::with_capacity(messages.len() + owners.len() + 4);
                replies.push(WireMessage::NewNodeConfirmed(self.local));
                replies.extend(messages.into_iter().map(WireMessage::Message));
                replies.push(WireMessage::Owners);
                replies.extend(
                    owners
                        .into_iter()
                        .map(|(message, owner)| WireMessage::Owner { message, owner }),
                );
                replies.push(WireMessage::OwnersEnd);
                replies.push(WireMessage::NewNodeOver);
                Step {
                    replies,
                    events: vec![ProtocolEvent::PartnerIdentified(node)],
                }
            }
            other => self.violation(other.to_string()),
        }
    }

    fn on_general(&mut self, message: WireMessage, store: &dyn MessageStore) -> Step {
        match message {
            // Our own START crossed the peer's.
            WireMessage::Start(_) => Step::default(),
            WireMessage::Auction(about) => {
                self.state = ConnectionState::Auction;
                self.auction = Some(AuctionSession {
                    role: Role::Responder,
                    about,
                    awaiting_ack: false,
                    queue: Vec::new(),
                    pending: HashMap::new(),
                    results: Vec::new(),
                    closing: false,
                });
                Step::reply(WireMessage::Auction(about))
            }
            WireMessage::GetMessage(id) => Self::answer_get(id, store),
            WireMessage::Message(body) => self.accept_body(body, store),
            WireMessage::MessageNotFound => {
                warn!(peer = ?self.partner, "peer could not supply a requested message");
                Step::default()
            }
            other => self.violation(other.to_string()),
        }
    }

    fn on_auction(&mut self, message: WireMessage, store: &dyn MessageStore) -> Step {
        match message {
            WireMessage::Auction(about) => self.on_auction_ack(about),
            WireMessage::Bid { id, value } => self.on_bid(id, value, store),
            WireMessage::AuctionOver => {
                let session = self.auction.take();
                self.state = ConnectionState::General;
                match session {
                    Some(s) if s.role == Role::Initiator && s.closing => {
                        Step::event(ProtocolEvent::AuctionFinished(s.results))
                    }
                    Some(s) if s.role == Role::Initiator => Step {
                        replies: vec![WireMessage::AuctionOver],
                        events: vec![ProtocolEvent::AuctionFinished(s.results)],
                    },
                    _ => Step::reply(WireMessage::AuctionOver),
                }
            }
            WireMessage::GetMessage(id) => Self::answer_get(id, store),
            WireMessage::Message(body) => self.accept_body(body, store),
            WireMessage::MessageNotFound => {
                warn!(peer = ?self.partner, "peer could not supply an auctioned message");
                Step::default()
            }
            other => self.violation(other.to_string()),
        }
    }

    fn on_auction_ack(&mut self, about: NodeId) -> Step {
        if let Some(step) = self.on_crossed_auction(about) {
            return step;
        }
        let bids = &mut self.bids;
        let Some(session) = self
            .auction
            .as_mut()
            .filter(|s| s.role == Role::Initiator && s.awaiting_ack && s.about == about)
        else {
            return self.violation(WireMessage::Auction(about).to_string());
        };

        session.awaiting_ack = false;
        let mut step = Step::default();
        for id in std::mem::take(&mut session.queue) {
            let value = bids.next_bid();
            session.pending.insert(id, value);
            step.replies.push(WireMessage::Bid { id, value });
        }
        if session.settled() {
            session.closing = true;
            step.replies.push(WireMessage::AuctionOver);
        }
        step
    }

    /// Both sides opened an auction about different nodes. The side with the
    /// lower node ID abandons its own, uncontested, and answers the peer's;
    /// the other side keeps waiting for that answer.
    fn on_crossed_auction(&mut self, about: NodeId) -> Option<Step> {
        let partner = self.partner?;
        let session = self.auction.as_ref()?;
        if session.role != Role::Initiator || !session.awaiting_ack || session.about == about {
            return None;
        }
        if self.local > partner {
            debug!(ours = %session.about, theirs = %about, "crossed auction, waiting for the peer to yield");
            return Some(Step::default());
        }
        debug!(ours = %session.about, theirs = %about, "crossed auction, yielding");
        let abandoned = self.auction.replace(AuctionSession {
            role: Role::Responder,
            about,
            awaiting_ack: false,
            queue: Vec::new(),
            pending: HashMap::new(),
            results: Vec::new(),
            closing: false,
        });
        Some(Step {
            replies: vec![WireMessage::Auction(about)],
            events: abandoned
                .map(|s| ProtocolEvent::AuctionFinished(s.results))
                .into_iter()
                .collect(),
        })
    }

    fn on_bid(&mut self, id: MessageId, theirs: i32, store: &dyn MessageStore) -> Step {
        let (local, partner) = (self.local, self.partner);
        let Some(partner) = partner else {
            return self.violation(WireMessage::Bid { id, value: theirs }.to_string());
        };
        let bids = &mut self.bids;
        let Some(session) = self.auction.as_mut() else {
            return self.violation(WireMessage::Bid { id, value: theirs }.to_string());
        };
        if session.closing {
            debug!(message = %id, "ignoring late bid on a closing auction");
            return Step::default();
        }

        let mut step = Step::default();
        let ours = if let Some(value) = session.pending.remove(&id) {
            value
        } else {
            let value = bids.next_bid();
            step.replies.push(WireMessage::Bid { id, value });
            value
        };

        let settled = match resolve_bid(ours, theirs) {
            BidOutcome::Won => {
                if let Err(e) = store.set_owner(id, local) {
                    return self.store_failure(&e);
                }
                if !store.contains_message(id) {
                    step.replies.push(WireMessage::GetMessage(id));
                }
                Some(AuctionOutcome::Won)
            }
            BidOutcome::Lost => {
                if let Err(e) = store.set_owner(id, partner) {
                    return self.store_failure(&e);
                }
                Some(AuctionOutcome::Lost)
            }
            BidOutcome::Tie => {
                if session.role == Role::Initiator {
                    let value = bids.next_bid();
                    session.pending.insert(id, value);
                    step.replies.push(WireMessage::Bid { id, value });
                    self.tie_retries += 1;
                }
                debug!(message = %id, bid = ours, "bid tied");
                None
            }
        };

        if let Some(outcome) = settled {
            debug!(message = %id, ours, theirs, ?outcome, "bid settled");
            session.results.push((id, outcome));
        }
        if session.role == Role::Initiator && session.settled() {
            session.closing = true;
            step.replies.push(WireMessage::AuctionOver);
        }
        step
    }

    fn on_new_node(&mut self, message: WireMessage, store: &dyn MessageStore) -> Step {
        match message {
            WireMessage::NewNodeConfirmed(node)
                if matches!(self.catch_up, Some(CatchUp::Requester { .. })) =>
            {
                self.partner = Some(node);
                Step::event(ProtocolEvent::PartnerIdentified(node))
            }
            WireMessage::Message(body) if matches!(self.catch_up, Some(CatchUp::Requester { .. })) => {
                if let Err(e) = store.record_message(body) {
                    return self.store_failure(&e);
                }
                if let Some(CatchUp::Requester { received, .. }) = self.catch_up.as_mut() {
                    *received += 1;
                }
                Step::default()
            }
            WireMessage::Owners | WireMessage::OwnersEnd
                if matches!(self.catch_up, Some(CatchUp::Requester { .. })) =>
            {
                Step::default()
            }
            WireMessage::Owner { message, owner }
                if matches!(self.catch_up, Some(CatchUp::Requester { .. })) =>
            {
                if let Err(e) = store.set_owner(message, owner) {
                    return self.store_failure(&e);
                }
                if let Some(CatchUp::Requester { owners, .. }) = self.catch_up.as_mut() {
                    *owners += 1;
                }
                Step::default()
            }
            WireMessage::NewNodeOver => {
                let catch_up = self.catch_up.take();
                self.state = ConnectionState::Start;
                match catch_up {
                    Some(CatchUp::Requester { received, owners }) => Step {
                        replies: vec![WireMessage::NewNodeOver],
                        events: vec![ProtocolEvent::CatchUpFinished {
                            messages: received,
                            owners,
                        }],
                    },
                    _ => Step::default(),
                }
            }
            other => self.violation(other.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// The partner accepted a new message and owns it.
    fn on_created(&mut self, created: Message, store: &dyn MessageStore) -> Step {
        let Some(partner) = self.partner else {
            return self.violation(WireMessage::MessageCreated(created).to_string());
        };
        let id = created.id;
        match store
            .record_message(created)
            .and_then(|()| store.set_owner(id, partner))
        {
            Ok(()) => Step::default(),
            Err(e) => self.store_failure(&e),
        }
    }

    fn answer_get(id: MessageId, store: &dyn MessageStore) -> Step {
        match store.message(id) {
            Ok(Some(body)) => Step::reply(WireMessage::Message(body)),
            Ok(None) => Step::reply(WireMessage::MessageNotFound),
            Err(e) => {
                warn!(message = %id, error = %e, "failed to load requested message");
                Step::reply(WireMessage::MessageNotFound)
            }
        }
    }

    fn accept_body(&mut self, body: Message, store: &dyn MessageStore) -> Step {
        match store.record_message(body) {
            Ok(()) => Step::default(),
            Err(e) => self.store_failure(&e),
        }
    }

    /// Back to START; closes any open dialog.
    fn reset(&mut self) -> Vec<ProtocolEvent> {
        self.state = ConnectionState::Start;
        self.start_sent = false;
        self.catch_up = None;
        match self.auction.take() {
            Some(s) if s.role == Role::Initiator => vec![ProtocolEvent::AuctionFinished(s.results)],
            _ => Vec::new(),
        }
    }

    fn violation(&mut self, received: String) -> Step {
        let state = self.state;
        warn!(%state, %received, peer = ?self.partner, "protocol violation");
        let mut events = vec![ProtocolEvent::ProtocolViolation { state, received }];
        events.extend(self.reset());
        Step {
            replies: vec![WireMessage::Error],
            events,
        }
    }

    fn store_failure(&mut self, e: &StoreError) -> Step {
        error!(error = %e, state = %self.state, "store operation failed during protocol step");
        let mut events = self.reset();
        events.push(ProtocolEvent::ProtocolViolation {
            state: ConnectionState::Start,
            received: format!("store failure: {e}"),
        });
        Step {
            replies: vec![WireMessage::Error],
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
