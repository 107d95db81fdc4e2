//! Randomized bidding: per-message bid comparison and dead-node elections.
//!
//! An [`Election`] is created when a peer is declared dead. Its voters are
//! every surviving node still reachable from here (the local node included,
//! the dead node excluded). Vote counting and message redistribution are
//! separate operations. The leader draw is seeded from [`seeded_rng`]; each
//! redistributed message gets an owner derived from the dead node and the
//! message ID alone, so survivors that hold different message sets still
//! agree on every message they share.

use courier_core::{MessageId, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::types::{BidOutcome, ElectionResult, Voter};
use crate::storage::{MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("election ended in a tie")]
    Tie,
    #[error("no leader has been elected yet")]
    NoLeader,
    #[error("election has no dead node to redistribute")]
    NoDeadNode,
    #[error("election has no voters")]
    NoVoters,
    #[error("node {0} is not a voter in this election")]
    UnknownVoter(NodeId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compares our bid against the peer's.
#[must_use]
pub fn resolve_bid(ours: i32, theirs: i32) -> BidOutcome {
    match ours.cmp(&theirs) {
        std::cmp::Ordering::Greater => BidOutcome::Won,
        std::cmp::Ordering::Less => BidOutcome::Lost,
        std::cmp::Ordering::Equal => BidOutcome::Tie,
    }
}

/// RNG derived from the dead node's ID, identical on every survivor.
#[must_use]
pub fn seeded_rng(dead_node: NodeId) -> StdRng {
    StdRng::seed_from_u64(fold(dead_node.as_u128()))
}

/// RNG for one of the dead node's messages.
fn message_rng(dead_node: NodeId, message: MessageId) -> StdRng {
    StdRng::seed_from_u64(fold(dead_node.as_u128() ^ message.as_u128()))
}

#[allow(clippy::cast_possible_truncation)]
fn fold(bits: u128) -> u64 {
    (bits >> 64) as u64 ^ bits as u64
}

#[derive(Debug, Clone)]
pub struct Election {
    dead_node: Option<NodeId>,
    /// Sorted by node ID so every survivor indexes voters identically.
    voters: Vec<Voter>,
    result: ElectionResult,
}

impl Election {
    /// Election among `candidates` with no dead node recorded.
    #[must_use]
    pub fn new(candidates: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: Vec<NodeId> = candidates.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        Self {
            dead_node: None,
            voters: nodes
                .into_iter()
                .map(|node| Voter { node, vote: None })
                .collect(),
            result: ElectionResult::StillTallying,
        }
    }

    /// Election over `dead_node`'s messages; the dead node never votes.
    #[must_use]
    pub fn for_dead_node(dead_node: NodeId, candidates: impl IntoIterator<Item = NodeId>) -> Self {
        let mut election = Self::new(candidates.into_iter().filter(|n| *n != dead_node));
        election.dead_node = Some(dead_node);
        election
    }

    #[must_use]
    pub fn dead_node(&self) -> Option<NodeId> {
        self.dead_node
    }

    #[must_use]
    pub fn voters(&self) -> &[Voter] {
        &self.voters
    }

    #[must_use]
    pub fn voter_ids(&self) -> Vec<NodeId> {
        self.voters.iter().map(|v| v.node).collect()
    }

    /// Result of the last [`count_votes`](Self::count_votes).
    #[must_use]
    pub fn result(&self) -> ElectionResult {
        self.result
    }

    /// Records `node`'s vote, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`ElectionError::UnknownVoter`] if `node` is not a voter.
    pub fn vote(&mut self, node: NodeId, value: i32) -> Result<(), ElectionError> {
        let voter = self
            .voters
            .iter_mut()
            .find(|v| v.node == node)
            .ok_or(ElectionError::UnknownVoter(node))?;
        voter.vote = Some(value);
        Ok(())
    }

    /// Draws a fresh vote for every voter.
    pub fn cast_votes<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for voter in &mut self.voters {
            voter.vote = Some(rng.random());
        }
        self.result = ElectionResult::StillTallying;
    }

    #[must_use]
    pub fn all_votes_in(&self) -> bool {
        self.voters.iter().all(|v| v.vote.is_some())
    }

    /// Tallies the votes and stores the result.
    pub fn count_votes(&mut self) -> ElectionResult {
        let votes: Option<Vec<i32>> = self.voters.iter().map(|v| v.vote).collect();
        self.result = match votes {
            None => ElectionResult::StillTallying,
            Some(votes) => match votes.iter().max() {
                None => ElectionResult::StillTallying,
                Some(max) if votes.iter().filter(|v| *v == max).count() > 1 => {
                    ElectionResult::Tie
                }
                Some(_) => ElectionResult::LeaderElected,
            },
        };
        self.result
    }

    /// The voter holding the unique highest vote.
    ///
    /// # Errors
    ///
    /// Returns [`ElectionError::NoLeader`] unless the last count elected a leader.
    pub fn leader(&self) -> Result<NodeId, ElectionError> {
        if self.result != ElectionResult::LeaderElected {
            return Err(ElectionError::NoLeader);
        }
        self.voters
            .iter()
            .filter_map(|v| v.vote.map(|vote| (vote, v.node)))
            .max()
            .map(|(_, node)| node)
            .ok_or(ElectionError::NoLeader)
    }

    /// Casts and counts until a leader emerges, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`ElectionError::NoVoters`] for an empty election.
    pub fn elect<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<NodeId, ElectionError> {
        if self.voters.is_empty() {
            return Err(ElectionError::NoVoters);
        }
        loop {
            self.cast_votes(rng);
            match self.count_votes() {
                ElectionResult::LeaderElected => return self.leader(),
                ElectionResult::Tie => debug!(dead_node = ?self.dead_node, "election tied, voting again"),
                ElectionResult::StillTallying => {}
            }
        }
    }

    /// Assigns every message the dead node owned to a uniformly chosen voter,
    /// writing each new owner through the store. The choice for a message
    /// depends only on the dead node, the message ID and the voter set.
    /// Returns the assignments in message ID order.
    ///
    /// # Errors
    ///
    /// Returns [`ElectionError::Tie`] when the last count tied,
    /// [`ElectionError::NoDeadNode`] or [`ElectionError::NoVoters`] when there
    /// is nothing to divide or nobody to divide among, and
    /// [`ElectionError::Store`] if an ownership write fails.
    pub fn divide_up_nodes_messages(
        &self,
        store: &dyn MessageStore,
    ) -> Result<Vec<(MessageId, NodeId)>, ElectionError> {
        if self.result == ElectionResult::Tie {
            return Err(ElectionError::Tie);
        }
        let dead_node = self.dead_node.ok_or(ElectionError::NoDeadNode)?;
        if self.voters.is_empty() {
            return Err(ElectionError::NoVoters);
        }

        let messages = store.messages_owned_by(dead_node);
        let mut assignments = Vec::with_capacity(messages.len());
        for id in messages {
            let pick = message_rng(dead_node, id).random_range(0..self.voters.len());
            let owner = self.voters[pick].node;
            store.set_owner(id, owner)?;
            assignments.push((id, owner));
        }
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::Message;
    use proptest::prelude::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::MessageLog;

    fn store_in(dir: &TempDir) -> MessageLog {
        MessageLog::open(&StorageConfig {
            message_log: dir.path().join("messages.log"),
            owner_log: dir.path().join("owners.log"),
            ..StorageConfig::default()
        })
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn dead_node_is_excluded_from_voters() {
        let ids = nodes(3);
        let election = Election::for_dead_node(ids[0], ids.clone());
        assert_eq!(election.voter_ids(), ids[1..].to_vec());
        assert_eq!(election.dead_node(), Some(ids[0]));
    }

    #[test]
    fn tally_states() {
        let ids = nodes(3);
        let mut election = Election::new(ids.clone());
        election.vote(ids[0], 5).unwrap();
        assert!(!election.all_votes_in());
        assert_eq!(election.count_votes(), ElectionResult::StillTallying);
        assert!(matches!(election.leader(), Err(ElectionError::NoLeader)));

        election.vote(ids[1], 9).unwrap();
        election.vote(ids[2], 9).unwrap();
        assert_eq!(election.count_votes(), ElectionResult::Tie);
        assert!(matches!(election.leader(), Err(ElectionError::NoLeader)));

        election.vote(ids[2], -1).unwrap();
        assert_eq!(election.count_votes(), ElectionResult::LeaderElected);
        assert_eq!(election.leader().unwrap(), ids[1]);
    }

    #[test]
    fn vote_from_outsider_is_rejected() {
        let mut election = Election::new(nodes(2));
        let outsider = Uuid::new_v4();
        assert!(matches!(
            election.vote(outsider, 1),
            Err(ElectionError::UnknownVoter(n)) if n == outsider
        ));
    }

    #[test]
    fn elect_picks_a_voter() {
        let ids = nodes(4);
        let mut election = Election::for_dead_node(ids[0], ids.clone());
        let leader = election.elect(&mut seeded_rng(ids[0])).unwrap();
        assert!(ids[1..].contains(&leader));
        assert_eq!(election.result(), ElectionResult::LeaderElected);
    }

    #[test]
    fn divide_reassigns_every_message_of_the_dead_node() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ids = nodes(3);
        let (dead, survivors) = (ids[0], &ids[1..]);
        let mut owned = Vec::new();
        for _ in 0..20 {
            let message = Message::new("s", "d", b"x".to_vec());
            owned.push(message.id);
            store.add_message(message, dead).unwrap();
        }
        let bystander = Message::new("s", "d", b"y".to_vec());
        store.add_message(bystander.clone(), survivors[0]).unwrap();

        let election = Election::for_dead_node(dead, ids.clone());
        let assignments = election
            .divide_up_nodes_messages(&store)
            .unwrap();

        assert_eq!(assignments.len(), owned.len());
        for (id, owner) in &assignments {
            assert!(survivors.contains(owner));
            assert_eq!(store.owner_of(*id), Some(*owner));
        }
        assert!(store.messages_owned_by(dead).is_empty());
        assert_eq!(store.owner_of(bystander.id), Some(survivors[0]));
    }

    #[test]
    fn same_seed_and_view_give_same_assignment() {
        let ids = nodes(4);
        let dead = ids[0];
        let mut results = Vec::new();
        for view in [ids.clone(), ids.iter().rev().copied().collect::<Vec<_>>()] {
            let dir = TempDir::new().unwrap();
            let store = store_in(&dir);
            for n in 0..10u128 {
                let id = Uuid::from_u128(n + 1);
                store.add_message(Message::with_id(id, "s", "d", b"x".to_vec()), dead).unwrap();
            }
            let mut election = Election::for_dead_node(dead, view);
            let leader = election.elect(&mut seeded_rng(dead)).unwrap();
            let assignments = election.divide_up_nodes_messages(&store).unwrap();
            results.push((leader, assignments));
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn survivors_with_different_messages_agree_on_shared_ones() {
        let (b, c) = (Uuid::from_u128(0xb), Uuid::from_u128(0xc));
        let (m1, m2, m3) = (Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let mut diverged = Vec::new();
        for _ in 0..50 {
            let dead = Uuid::new_v4();
            let mut views = Vec::new();
            for held in [vec![m1, m2, m3], vec![m2, m3]] {
                let dir = TempDir::new().unwrap();
                let store = store_in(&dir);
                for id in held {
                    store.add_message(Message::with_id(id, "s", "d", b"x".to_vec()), dead).unwrap();
                }
                let mut election = Election::for_dead_node(dead, [b, c]);
                election.elect(&mut seeded_rng(dead)).unwrap();
                election.divide_up_nodes_messages(&store).unwrap();
                views.push(store);
            }
            for id in [m2, m3] {
                if views[0].owner_of(id) != views[1].owner_of(id) {
                    diverged.push((dead, id));
                }
            }
        }
        assert!(diverged.is_empty(), "diverging assignments: {diverged:?}");
    }

    #[test]
    fn sole_survivor_takes_everything() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let (dead, me) = (Uuid::new_v4(), Uuid::new_v4());
        let message = Message::new("s", "d", b"x".to_vec());
        store.add_message(message.clone(), dead).unwrap();

        let election = Election::for_dead_node(dead, [me, dead]);
        let assignments = election
            .divide_up_nodes_messages(&store)
            .unwrap();
        assert_eq!(assignments, vec![(message.id, me)]);
    }

    #[test]
    fn divide_refuses_tie_and_missing_dead_node() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let ids = nodes(3);

        let mut tied = Election::for_dead_node(ids[0], ids.clone());
        tied.vote(ids[1], 3).unwrap();
        tied.vote(ids[2], 3).unwrap();
        tied.count_votes();
        assert!(matches!(
            tied.divide_up_nodes_messages(&store),
            Err(ElectionError::Tie)
        ));

        let no_dead = Election::new(ids.clone());
        assert!(matches!(
            no_dead.divide_up_nodes_messages(&store),
            Err(ElectionError::NoDeadNode)
        ));

        let nobody = Election::for_dead_node(ids[0], [ids[0]]);
        assert!(matches!(
            nobody.divide_up_nodes_messages(&store),
            Err(ElectionError::NoVoters)
        ));
    }

    proptest! {
        #[test]
        fn higher_bid_always_wins(a in any::<i32>(), b in any::<i32>()) {
            prop_assume!(a != b);
            let (high, low) = if a > b { (a, b) } else { (b, a) };
            prop_assert_eq!(resolve_bid(high, low), BidOutcome::Won);
            prop_assert_eq!(resolve_bid(low, high), BidOutcome::Lost);
        }
    }
}
