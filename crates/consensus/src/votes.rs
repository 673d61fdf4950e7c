//! Per-round vote tallies and equivocation evidence.
//!
//! Votes are keyed by `(round, kind, voter)`. The first vote from a voter
//! counts; a second vote for a different hash in the same round and kind
//! is kept as evidence and never counted.

use crate::ConsensusMessageType;
use std::collections::{BTreeMap, HashMap};
use vbft_cryptography::Hash256;

/// Conflicting messages from one member in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equivocation {
    pub height: u32,
    pub round: u32,
    pub sender: u32,
    pub kind: ConsensusMessageType,
    pub first: Hash256,
    pub second: Hash256,
}

/// Result of recording a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Added,
    Duplicate,
    Equivocation(Equivocation),
}

#[derive(Debug, Default, Clone)]
struct RoundVotes {
    endorse: BTreeMap<u32, Hash256>,
    commit: BTreeMap<u32, Hash256>,
}

impl RoundVotes {
    fn slot(&mut self, kind: ConsensusMessageType) -> &mut BTreeMap<u32, Hash256> {
        match kind {
            ConsensusMessageType::Commit => &mut self.commit,
            _ => &mut self.endorse,
        }
    }

    fn get(&self, kind: ConsensusMessageType) -> &BTreeMap<u32, Hash256> {
        match kind {
            ConsensusMessageType::Commit => &self.commit,
            _ => &self.endorse,
        }
    }
}

/// Endorse and commit votes for one height.
#[derive(Debug, Default, Clone)]
pub struct VoteTally {
    height: u32,
    rounds: BTreeMap<u32, RoundVotes>,
    evidence: Vec<Equivocation>,
}

impl VoteTally {
    pub fn new(height: u32) -> Self {
        Self {
            height,
            ..Default::default()
        }
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Records a vote. `kind` must be [`ConsensusMessageType::Endorse`] or
    /// [`ConsensusMessageType::Commit`].
    pub fn add(
        &mut self,
        round: u32,
        kind: ConsensusMessageType,
        voter: u32,
        block_hash: Hash256,
    ) -> VoteOutcome {
        debug_assert!(kind.is_vote());
        let slot = self.rounds.entry(round).or_default().slot(kind);
        match slot.get(&voter) {
            None => {
                slot.insert(voter, block_hash);
                VoteOutcome::Added
            }
            Some(existing) if *existing == block_hash => VoteOutcome::Duplicate,
            Some(existing) => {
                let evidence = Equivocation {
                    height: self.height,
                    round,
                    sender: voter,
                    kind,
                    first: *existing,
                    second: block_hash,
                };
                self.evidence.push(evidence.clone());
                VoteOutcome::Equivocation(evidence)
            }
        }
    }

    /// Hash `voter` voted for, if any.
    pub fn vote_of(&self, round: u32, kind: ConsensusMessageType, voter: u32) -> Option<Hash256> {
        self.rounds
            .get(&round)
            .and_then(|votes| votes.get(kind).get(&voter).copied())
    }

    /// Number of distinct voters for `block_hash`.
    pub fn count(&self, round: u32, kind: ConsensusMessageType, block_hash: &Hash256) -> usize {
        self.rounds.get(&round).map_or(0, |votes| {
            votes.get(kind).values().filter(|h| *h == block_hash).count()
        })
    }

    /// Number of distinct voters in the round, whatever they voted for.
    pub fn voters(&self, round: u32, kind: ConsensusMessageType) -> usize {
        self.rounds.get(&round).map_or(0, |votes| votes.get(kind).len())
    }

    /// The hash holding at least `quorum` votes, if one exists.
    pub fn quorum_hash(
        &self,
        round: u32,
        kind: ConsensusMessageType,
        quorum: usize,
    ) -> Option<Hash256> {
        let votes = self.rounds.get(&round)?;
        let mut counts: HashMap<Hash256, usize> = HashMap::new();
        for hash in votes.get(kind).values() {
            let count = counts.entry(*hash).or_default();
            *count += 1;
            if *count >= quorum {
                return Some(*hash);
            }
        }
        None
    }

    pub fn has_quorum(
        &self,
        round: u32,
        kind: ConsensusMessageType,
        block_hash: &Hash256,
        quorum: usize,
    ) -> bool {
        self.count(round, kind, block_hash) >= quorum
    }

    /// Rounds with at least one recorded vote.
    pub fn rounds(&self) -> impl Iterator<Item = u32> + '_ {
        self.rounds.keys().copied()
    }

    pub fn evidence(&self) -> &[Equivocation] {
        &self.evidence
    }
}
