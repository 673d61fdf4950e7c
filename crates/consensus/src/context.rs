//! Consensus context - per-height working state of the state machine.

use crate::block::{Block, BlockHeader};
use crate::codec::SerializableExt;
use crate::leader::select_leader;
use crate::messages::{BlockProposal, VerifiedMessage};
use crate::votes::VoteTally;
use crate::{ConsensusError, ConsensusMessageType, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use vbft_config::ChainConfig;
use vbft_cryptography::Hash256;

/// Maximum size of message hash cache (memory protection)
pub const MAX_MESSAGE_CACHE_SIZE: usize = 10_000;

/// Maximum messages buffered for the next height
pub const MAX_NEXT_HEIGHT_MESSAGES: usize = 1_024;

/// Maximum messages buffered for future rounds of the current height
pub const MAX_FUTURE_ROUND_MESSAGES: usize = 4_096;

/// Steps of a height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Step {
    /// Waiting to begin a height
    #[default]
    Idle,
    /// Leader is building its proposal
    Proposing,
    /// Waiting for the proposal and votes
    Collecting,
    /// Commit quorum reached, waiting for the ledger append
    Finalizing,
    /// Block durably appended
    Committed,
}

impl Step {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Proposing => "Proposing",
            Self::Collecting => "Collecting",
            Self::Finalizing => "Finalizing",
            Self::Committed => "Committed",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block hash tied to the round in which it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundValue {
    pub round: u32,
    pub block_hash: Hash256,
}

/// Persisted consensus state for crash recovery.
/// Holds what is needed to never contradict an earlier vote after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedConsensusState {
    height: u32,
    round: u32,
    locked: Option<RoundValue>,
    valid: Option<RoundValue>,
    /// Encoded blocks referenced by `locked` and `valid`
    blocks: Vec<Vec<u8>>,
    /// Own votes: (round, kind, block hash)
    own_votes: Vec<(u32, ConsensusMessageType, Hash256)>,
    /// Own proposal: (round, encoded proposal)
    own_proposal: Option<(u32, Vec<u8>)>,
}

/// Consensus context holding all state for the current height
#[derive(Debug)]
pub struct ConsensusContext {
    /// Height being agreed upon
    pub height: u32,
    /// Current round
    pub round: u32,
    pub step: Step,
    /// When the current round started (ms)
    pub round_start: u64,
    /// This node's committee index
    pub my_index: Option<u32>,
    /// Sorted committee indices
    pub committee: Vec<u32>,
    pub quorum: usize,
    pub max_faulty: usize,
    /// Header of the last committed block
    pub parent: BlockHeader,
    pub parent_hash: Hash256,
    /// Validated proposals by round
    pub proposals: BTreeMap<u32, BlockProposal>,
    /// Validated candidate blocks by hash
    pub blocks: HashMap<Hash256, Block>,
    pub votes: VoteTally,
    /// Block this node is locked on
    pub locked: Option<RoundValue>,
    /// Most recent block seen with an endorsement quorum
    pub valid: Option<RoundValue>,
    /// Decided block for this height
    pub decision: Option<RoundValue>,
    /// Proposal this node made, if any
    pub own_proposal: Option<(u32, BlockProposal)>,
    future_messages: BTreeMap<u32, Vec<VerifiedMessage>>,
    future_count: usize,
    round_senders: BTreeMap<u32, BTreeSet<u32>>,
    next_height_messages: VecDeque<VerifiedMessage>,
    seen_message_hashes: HashSet<Hash256>,
}

impl ConsensusContext {
    /// Creates an idle context for the committee in `config`.
    pub fn new(my_index: Option<u32>, config: &ChainConfig, parent: &BlockHeader) -> Self {
        let mut committee: Vec<u32> = config.peers.iter().map(|p| p.index).collect();
        committee.sort_unstable();
        Self {
            height: parent.height + 1,
            round: 0,
            step: Step::Idle,
            round_start: 0,
            my_index,
            committee,
            quorum: config.quorum(),
            max_faulty: config.max_faulty(),
            parent: parent.clone(),
            parent_hash: parent.hash(),
            proposals: BTreeMap::new(),
            blocks: HashMap::new(),
            votes: VoteTally::new(parent.height + 1),
            locked: None,
            valid: None,
            decision: None,
            own_proposal: None,
            future_messages: BTreeMap::new(),
            future_count: 0,
            round_senders: BTreeMap::new(),
            next_height_messages: VecDeque::new(),
            seen_message_hashes: HashSet::new(),
        }
    }

    /// Switches to a new committee. Takes effect for the next height.
    pub fn set_committee(&mut self, my_index: Option<u32>, config: &ChainConfig) {
        let mut committee: Vec<u32> = config.peers.iter().map(|p| p.index).collect();
        committee.sort_unstable();
        self.committee = committee;
        self.my_index = my_index;
        self.quorum = config.quorum();
        self.max_faulty = config.max_faulty();
    }

    /// Number of committee members
    pub fn validator_count(&self) -> usize {
        self.committee.len()
    }

    /// Leader of `round` at the current height
    pub fn leader(&self, round: u32) -> Option<u32> {
        select_leader(&self.committee, &self.parent.vrf_value, round)
    }

    /// Returns true if this node leads the current round
    pub fn is_leader(&self) -> bool {
        self.my_index.is_some() && self.leader(self.round) == self.my_index
    }

    pub fn is_member(&self, index: u32) -> bool {
        self.committee.binary_search(&index).is_ok()
    }

    /// Resets for a new height on top of `parent`. Returns the messages that
    /// were buffered for that height.
    pub fn reset_for_new_height(&mut self, parent: &BlockHeader, timestamp: u64) -> Vec<VerifiedMessage> {
        self.height = parent.height + 1;
        self.round = 0;
        self.step = Step::Idle;
        self.round_start = timestamp;
        self.parent = parent.clone();
        self.parent_hash = parent.hash();
        self.proposals.clear();
        self.blocks.clear();
        self.votes = VoteTally::new(self.height);
        self.locked = None;
        self.valid = None;
        self.decision = None;
        self.own_proposal = None;
        self.future_messages.clear();
        self.future_count = 0;
        self.round_senders.clear();
        self.seen_message_hashes.clear();

        let height = self.height;
        self.next_height_messages
            .drain(..)
            .filter(|msg| msg.height() == height)
            .collect()
    }

    /// Moves to `round`. Returns the buffered messages for that round;
    /// buffered messages for earlier rounds are discarded.
    pub fn reset_for_new_round(&mut self, round: u32, timestamp: u64) -> Vec<VerifiedMessage> {
        self.round = round;
        self.round_start = timestamp;
        self.step = Step::Collecting;
        self.round_senders = self.round_senders.split_off(&(round + 1));

        let later = self.future_messages.split_off(&(round + 1));
        let current = std::mem::replace(&mut self.future_messages, later);
        let mut replay = Vec::new();
        for (r, messages) in current {
            self.future_count -= messages.len();
            if r == round {
                replay = messages;
            }
        }
        replay
    }

    /// Deadline of the current round for the configured timeout base
    pub fn round_deadline(&self, config: &ChainConfig) -> u64 {
        self.round_start.saturating_add(config.round_timeout(self.round))
    }

    /// Returns true once the current round's deadline has passed
    pub fn is_timed_out(&self, config: &ChainConfig, now: u64) -> bool {
        now >= self.round_deadline(config)
    }

    /// Holds a message for a later round and records its sender. Returns
    /// false when the buffer is full.
    pub fn buffer_future(&mut self, message: VerifiedMessage) -> bool {
        self.round_senders
            .entry(message.round())
            .or_default()
            .insert(message.sender());
        if self.future_count >= MAX_FUTURE_ROUND_MESSAGES {
            return false;
        }
        self.future_count += 1;
        self.future_messages
            .entry(message.round())
            .or_default()
            .push(message);
        true
    }

    /// Highest future round with at least `threshold` distinct senders
    pub fn round_to_skip_to(&self, threshold: usize) -> Option<u32> {
        self.round_senders
            .iter()
            .rev()
            .find(|(round, senders)| **round > self.round && senders.len() >= threshold)
            .map(|(round, _)| *round)
    }

    /// Holds a message for the next height, evicting the oldest when full
    pub fn buffer_next_height(&mut self, message: VerifiedMessage) {
        if self.next_height_messages.len() >= MAX_NEXT_HEIGHT_MESSAGES {
            self.next_height_messages.pop_front();
        }
        self.next_height_messages.push_back(message);
    }

    pub fn next_height_buffered(&self) -> usize {
        self.next_height_messages.len()
    }

    /// Checks if a message hash has been seen before (replay attack prevention)
    pub fn has_seen_message(&self, hash: &Hash256) -> bool {
        self.seen_message_hashes.contains(hash)
    }

    /// Marks a message hash as seen; the cache is cleared when full
    pub fn mark_message_seen(&mut self, hash: &Hash256) {
        if self.seen_message_hashes.len() >= MAX_MESSAGE_CACHE_SIZE {
            tracing::warn!(
                limit = MAX_MESSAGE_CACHE_SIZE,
                "Message cache reached limit, clearing"
            );
            self.seen_message_hashes.clear();
        }
        self.seen_message_hashes.insert(*hash);
    }

    /// Saves the lock and own votes to disk
    ///
    /// Uses atomic write (write to temp file + rename) to prevent corruption.
    pub fn save(&self, path: &Path) -> ConsensusResult<()> {
        let mut blocks = Vec::new();
        for value in [self.locked, self.valid].into_iter().flatten() {
            if let Some(block) = self.blocks.get(&value.block_hash) {
                blocks.push(block.to_array());
            }
        }

        let mut own_votes = Vec::new();
        if let Some(me) = self.my_index {
            let rounds: Vec<u32> = self.votes.rounds().collect();
            for round in rounds {
                for kind in [ConsensusMessageType::Endorse, ConsensusMessageType::Commit] {
                    if let Some(hash) = self.votes.vote_of(round, kind, me) {
                        own_votes.push((round, kind, hash));
                    }
                }
            }
        }

        let state = PersistedConsensusState {
            height: self.height,
            round: self.round,
            locked: self.locked,
            valid: self.valid,
            blocks,
            own_votes,
            own_proposal: self
                .own_proposal
                .as_ref()
                .map(|(round, proposal)| (*round, proposal.to_array())),
        };

        let encoded = bincode::serialize(&state)?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &encoded)?;
        fs::rename(&temp_path, path)?;

        tracing::debug!(
            height = self.height,
            round = self.round,
            size = encoded.len(),
            "Saved consensus state"
        );

        Ok(())
    }

    /// Restores lock, votes and own proposal from `path` when it holds
    /// state for the current height. Returns whether anything was applied.
    pub fn restore_from(&mut self, path: &Path) -> ConsensusResult<bool> {
        let encoded = fs::read(path)?;
        let state: PersistedConsensusState = bincode::deserialize(&encoded)?;

        if state.height != self.height {
            tracing::debug!(
                persisted = state.height,
                current = self.height,
                "Ignoring persisted consensus state for another height"
            );
            return Ok(false);
        }

        for raw in &state.blocks {
            let block = Block::from_array(raw)
                .map_err(|e| ConsensusError::Persistence(format!("stored block: {}", e)))?;
            self.blocks.insert(block.hash(), block);
        }
        let own_proposal = match state.own_proposal {
            Some((round, raw)) => {
                let proposal = BlockProposal::from_array(&raw)
                    .map_err(|e| ConsensusError::Persistence(format!("stored proposal: {}", e)))?;
                self.blocks
                    .insert(proposal.block.hash(), proposal.block.clone());
                Some((round, proposal))
            }
            None => None,
        };

        if let Some(me) = self.my_index {
            for (round, kind, hash) in &state.own_votes {
                self.votes.add(*round, *kind, me, *hash);
            }
        }

        self.round = self.round.max(state.round);
        self.locked = state.locked;
        self.valid = state.valid;
        self.own_proposal = own_proposal;

        tracing::info!(
            height = self.height,
            round = self.round,
            locked = ?self.locked.map(|l| l.round),
            votes = state.own_votes.len(),
            "Loaded consensus state"
        );

        Ok(true)
    }
}
