//! Consensus service - the main VBFT state machine.
//!
//! The service owns all per-height state and is driven by
//! [`ConsensusCommand`]s from a single consumer. Everything it needs done
//! outside itself (broadcasting, appending to the ledger) is emitted as a
//! [`ConsensusEvent`].

use crate::block::{compute_tx_root, vrf_input, Block, BlockHeader, Transaction, BLOCK_VERSION};
use crate::context::{ConsensusContext, RoundValue, Step};
use crate::ledger::Ledger;
use crate::messages::{
    BlockProposal, ConsensusMessage, ConsensusPayload, PeerStatus, SignedMessage, VerifiedMessage,
    Vote,
};
use crate::peer_pool::PeerPool;
use crate::txpool::TxPool;
use crate::votes::{Equivocation, VoteOutcome};
use crate::{ConsensusError, ConsensusMessageType, ConsensusResult};
use metrics::{counter, gauge};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vbft_config::{ChainConfig, NodeId};
use vbft_cryptography::{vrf, Hash256, KeyPair};

/// Events emitted by the consensus service
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Send a message to every other member
    Broadcast(SignedMessage),
    /// Send a message to one member
    SendTo { index: u32, message: SignedMessage },
    /// Append a finalized block; answer with `ConsensusCommand::LedgerAppended`
    AppendBlock { height: u32, block: Block },
    /// Commit quorum reached for a block
    BlockFinalized {
        height: u32,
        round: u32,
        block_hash: Hash256,
    },
    /// Finalized block durably appended
    BlockCommitted { height: u32, block_hash: Hash256 },
    RoundChanged {
        height: u32,
        old_round: u32,
        new_round: u32,
    },
    RoundTimeout {
        height: u32,
        round: u32,
        leader: Option<u32>,
    },
    /// Too few members reachable to ever reach quorum
    Stalled {
        height: u32,
        round: u32,
        active_peers: usize,
        quorum: usize,
    },
    /// A member sent conflicting messages in one round
    Equivocation(Equivocation),
}

/// Commands that can be sent to the consensus service
#[derive(Debug)]
pub enum ConsensusCommand {
    /// Start consensus on top of the ledger tip
    Start { timestamp: u64 },
    /// Process a verified consensus message
    Message(VerifiedMessage),
    /// Timer tick (for timeout handling)
    Tick { timestamp: u64 },
    /// Outcome of an `AppendBlock` request
    LedgerAppended {
        height: u32,
        block_hash: Hash256,
        result: ConsensusResult<()>,
    },
    /// A member connected; it gets our handshake
    PeerConnected { index: u32 },
    /// Switch committee at the next height boundary
    Reconfigure(ChainConfig),
    /// Stop the consensus service
    Stop,
}

/// Snapshot for diagnostics and RPC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub height: u32,
    pub round: u32,
    pub step: Step,
    pub leader: Option<u32>,
    pub active_peers: usize,
    pub last_finalized_hash: Option<Hash256>,
    /// Time of the last committed block (ms)
    pub last_progress: u64,
    pub stalled: bool,
    pub running: bool,
}

/// The main consensus service implementing VBFT
pub struct ConsensusService {
    config: ChainConfig,
    /// Committee change waiting for the next height
    pending_config: Option<ChainConfig>,
    context: ConsensusContext,
    keypair: KeyPair,
    node_id: NodeId,
    pool: Arc<PeerPool>,
    ledger: Arc<dyn Ledger>,
    txpool: Arc<dyn TxPool>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    state_path: Option<PathBuf>,
    running: bool,
    /// Latest known time (ms)
    now: u64,
    last_heartbeat: u64,
    append_in_flight: bool,
    append_failures: u32,
    last_finalized_hash: Option<Hash256>,
    last_progress: u64,
    stalled: bool,
}

impl ConsensusService {
    /// Creates a new consensus service on top of the ledger tip
    pub fn new(
        config: ChainConfig,
        keypair: KeyPair,
        pool: Arc<PeerPool>,
        ledger: Arc<dyn Ledger>,
        txpool: Arc<dyn TxPool>,
        event_tx: mpsc::Sender<ConsensusEvent>,
    ) -> ConsensusResult<Self> {
        config.validate()?;
        let node_id = NodeId::from_public_key(&keypair.public_key().to_bytes());
        let my_index = config.index_of(&node_id);
        let tip = tip_of(ledger.as_ref())?;
        let context = ConsensusContext::new(my_index, &config, &tip.header);

        Ok(Self {
            config,
            pending_config: None,
            context,
            keypair,
            node_id,
            pool,
            ledger,
            txpool,
            event_tx,
            state_path: None,
            running: false,
            now: 0,
            last_heartbeat: 0,
            append_in_flight: false,
            append_failures: 0,
            last_finalized_hash: Some(tip.hash()),
            last_progress: 0,
            stalled: false,
        })
    }

    /// Persists lock and vote state to `path` before every vote
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Returns the current context (for testing/debugging)
    pub fn context(&self) -> &ConsensusContext {
        &self.context
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    pub fn my_index(&self) -> Option<u32> {
        self.context.my_index
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            height: self.context.height,
            round: self.context.round,
            step: self.context.step,
            leader: self.context.leader(self.context.round),
            active_peers: self.pool.get_active_peer_count(),
            last_finalized_hash: self.last_finalized_hash,
            last_progress: self.last_progress,
            stalled: self.stalled,
            running: self.running,
        }
    }

    /// Dispatches one command
    pub fn handle(&mut self, command: ConsensusCommand) -> ConsensusResult<()> {
        match command {
            ConsensusCommand::Start { timestamp } => self.start(timestamp),
            ConsensusCommand::Message(message) => self.process_message(message),
            ConsensusCommand::Tick { timestamp } => self.on_timer_tick(timestamp),
            ConsensusCommand::LedgerAppended {
                height,
                block_hash,
                result,
            } => self.on_ledger_appended(height, block_hash, result),
            ConsensusCommand::PeerConnected { index } => self.send_handshake(index),
            ConsensusCommand::Reconfigure(config) => self.reconfigure(config),
            ConsensusCommand::Stop => {
                info!(height = self.context.height, "Stopping consensus");
                self.running = false;
                Ok(())
            }
        }
    }

    /// Starts consensus for the height after the ledger tip
    pub fn start(&mut self, timestamp: u64) -> ConsensusResult<()> {
        if self.context.my_index.is_none() {
            return Err(ConsensusError::NotValidator);
        }

        self.now = timestamp;
        self.last_heartbeat = timestamp;
        self.last_progress = timestamp;
        self.running = true;

        let tip = tip_of(self.ledger.as_ref())?;
        self.last_finalized_hash = Some(tip.hash());
        info!(
            tip = tip.height(),
            validator = ?self.context.my_index,
            members = self.context.validator_count(),
            "Starting consensus"
        );
        self.begin_height(&tip.header)
    }

    /// Processes a verified consensus message
    pub fn process_message(&mut self, message: VerifiedMessage) -> ConsensusResult<()> {
        if !self.running {
            return Ok(());
        }

        let digest = message.digest();
        if self.context.has_seen_message(&digest) {
            debug!(
                height = message.height(),
                validator = message.sender(),
                msg_type = %message.message_type(),
                "Ignoring duplicate message"
            );
            return Ok(());
        }
        self.context.mark_message_seen(&digest);

        self.admit(message)
    }

    /// Handles timer tick for heartbeats, round timeouts and append retries
    pub fn on_timer_tick(&mut self, timestamp: u64) -> ConsensusResult<()> {
        if !self.running {
            return Ok(());
        }
        self.now = timestamp;

        if self.context.my_index.is_some()
            && timestamp.saturating_sub(self.last_heartbeat) >= self.config.heartbeat_interval_msec
        {
            self.last_heartbeat = timestamp;
            self.send_heartbeat()?;
        }

        match self.context.step {
            Step::Proposing | Step::Collecting
                if self.context.is_timed_out(&self.config, timestamp) =>
            {
                self.on_round_timeout()
            }
            Step::Proposing => self.try_propose(),
            Step::Finalizing if !self.append_in_flight => {
                debug!(height = self.context.height, "Retrying ledger append");
                self.request_append()
            }
            _ => Ok(()),
        }
    }

    /// Handles the outcome of a ledger append
    pub fn on_ledger_appended(
        &mut self,
        height: u32,
        block_hash: Hash256,
        result: ConsensusResult<()>,
    ) -> ConsensusResult<()> {
        let decided = self.context.decision.map(|d| d.block_hash);
        if height != self.context.height
            || decided != Some(block_hash)
            || self.context.step != Step::Finalizing
        {
            debug!(height, "Ignoring stale ledger append result");
            return Ok(());
        }
        self.append_in_flight = false;

        // A timed-out append may still have landed
        let result = match result {
            Err(e)
                if self.ledger.block_by_height(height).map(|b| b.hash()) == Some(block_hash) =>
            {
                debug!(height, error = %e, "Block already in ledger");
                Ok(())
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.append_failures = 0;
                self.commit_height(block_hash)
            }
            Err(e) => {
                self.append_failures += 1;
                warn!(
                    height,
                    attempts = self.append_failures,
                    error = %e,
                    "Ledger append failed, will retry"
                );
                if self.append_failures >= self.config.max_append_retries {
                    error!(
                        height,
                        attempts = self.append_failures,
                        "Ledger unavailable, stopping consensus"
                    );
                    self.running = false;
                    return Err(ConsensusError::LedgerUnavailable {
                        height,
                        attempts: self.append_failures,
                    });
                }
                Ok(())
            }
        }
    }

    /// Replaces the committee, immediately when between heights and at the
    /// next height boundary otherwise
    pub fn reconfigure(&mut self, config: ChainConfig) -> ConsensusResult<()> {
        config.validate()?;
        if !self.running || matches!(self.context.step, Step::Idle | Step::Committed) {
            return self.apply_config(config);
        }
        info!(
            height = self.context.height,
            epoch = config.epoch,
            "Committee change scheduled for next height"
        );
        self.pending_config = Some(config);
        Ok(())
    }

    fn apply_config(&mut self, config: ChainConfig) -> ConsensusResult<()> {
        self.pool.reset(&config)?;
        let my_index = config.index_of(&self.node_id);
        self.context.set_committee(my_index, &config);
        info!(
            epoch = config.epoch,
            members = config.peers.len(),
            validator = ?my_index,
            "Committee reconfigured"
        );
        self.config = config;
        Ok(())
    }

    fn begin_height(&mut self, parent: &BlockHeader) -> ConsensusResult<()> {
        let buffered = self.context.reset_for_new_height(parent, self.now);

        if let Some(path) = &self.state_path {
            if path.exists() {
                if let Err(e) = self.context.restore_from(path) {
                    warn!(error = %e, "Failed to load consensus state");
                }
            }
        }

        gauge!("vbft_consensus_height", self.context.height as f64);
        info!(
            height = self.context.height,
            round = self.context.round,
            "Starting height"
        );

        let round = self.context.round;
        self.enter_round(round)?;

        for message in buffered {
            if let Err(e) = self.process_message(message) {
                debug!(error = %e, "Dropped buffered message");
            }
        }
        Ok(())
    }

    fn enter_round(&mut self, round: u32) -> ConsensusResult<()> {
        let replay = self.context.reset_for_new_round(round, self.now);
        gauge!("vbft_consensus_round", round as f64);

        debug!(
            height = self.context.height,
            round,
            leader = ?self.context.leader(round),
            "Entering round"
        );

        if self.context.is_leader() {
            self.context.step = Step::Proposing;
            self.try_propose()?;
        }

        for message in replay {
            if let Err(e) = self.admit(message) {
                debug!(error = %e, "Dropped replayed message");
            }
        }
        Ok(())
    }

    /// Height and round admission, then dispatch by message kind
    fn admit(&mut self, message: VerifiedMessage) -> ConsensusResult<()> {
        let sender = message.sender();
        match &message.message().payload {
            ConsensusPayload::Handshake(status) => return self.pool.peer_handshake(sender, *status),
            ConsensusPayload::Heartbeat(status) => return self.pool.peer_heartbeat(sender, *status),
            _ => {}
        }

        if !self.context.is_member(sender) {
            return Err(ConsensusError::UnknownPeer(sender));
        }

        let height = self.context.height;
        if message.height() < height {
            return Err(ConsensusError::StaleHeight {
                current: height,
                got: message.height(),
            });
        }
        if message.height() == height + 1 {
            debug!(height, validator = sender, "Buffering message for next height");
            self.context.buffer_next_height(message);
            return Ok(());
        }
        if message.height() > height + 1 {
            debug!(height, got = message.height(), "Dropping message for distant height");
            return Ok(());
        }
        if self.context.decision.is_some() {
            return Ok(());
        }

        let current = self.context.round;
        let round = message.round();
        if round < current {
            self.on_stale_round(&message)?;
            if self.context.decision.is_some() {
                return Ok(());
            }
            return Err(ConsensusError::StaleRound {
                current,
                got: round,
            });
        }
        if round > current {
            return self.on_future_round(message);
        }

        match &message.message().payload {
            ConsensusPayload::Proposal(proposal) => self.on_proposal(sender, proposal.clone()),
            ConsensusPayload::Endorse(vote) => {
                self.on_vote(ConsensusMessageType::Endorse, round, sender, vote.block_hash)
            }
            ConsensusPayload::Commit(vote) => {
                self.on_vote(ConsensusMessageType::Commit, round, sender, vote.block_hash)
            }
            ConsensusPayload::Handshake(_) | ConsensusPayload::Heartbeat(_) => Ok(()),
        }
    }

    /// Stale votes are kept for audit. A commit quorum from an earlier round
    /// still decides the height.
    fn on_stale_round(&mut self, message: &VerifiedMessage) -> ConsensusResult<()> {
        let (kind, vote) = match &message.message().payload {
            ConsensusPayload::Endorse(vote) => (ConsensusMessageType::Endorse, vote),
            ConsensusPayload::Commit(vote) => (ConsensusMessageType::Commit, vote),
            _ => return Ok(()),
        };
        let round = message.round();
        if let VoteOutcome::Equivocation(evidence) =
            self.context
                .votes
                .add(round, kind, message.sender(), vote.block_hash)
        {
            self.report_equivocation(evidence)?;
        }
        if kind == ConsensusMessageType::Commit {
            self.check_commit_quorum(round)?;
        }
        Ok(())
    }

    fn on_future_round(&mut self, message: VerifiedMessage) -> ConsensusResult<()> {
        let current = self.context.round;
        let round = message.round();
        if round - current > self.config.max_future_rounds {
            debug!(current, got = round, "Dropping message beyond future round window");
            return Ok(());
        }
        if !self.context.buffer_future(message) {
            debug!(round, "Future round buffer full");
        }

        if let Some(target) = self.context.round_to_skip_to(self.context.max_faulty + 1) {
            info!(
                height = self.context.height,
                from = current,
                to = target,
                "Skipping ahead, f+1 members are in a later round"
            );
            self.send_event(ConsensusEvent::RoundChanged {
                height: self.context.height,
                old_round: current,
                new_round: target,
            })?;
            self.enter_round(target)?;
        }
        Ok(())
    }

    /// Proposes once the block interval since the parent has passed. A
    /// pending re-proposal does not wait.
    fn try_propose(&mut self) -> ConsensusResult<()> {
        let earliest = self
            .context
            .parent
            .timestamp
            .saturating_add(self.config.block_msec);
        let has_candidate = self.context.valid.is_some()
            || matches!(&self.context.own_proposal, Some((r, _)) if *r == self.context.round);
        if self.now < earliest && !has_candidate {
            debug!(
                height = self.context.height,
                wait_ms = earliest - self.now,
                "Waiting for block interval"
            );
            return Ok(());
        }
        self.propose()
    }

    /// Builds or re-proposes a block as leader of the current round
    fn propose(&mut self) -> ConsensusResult<()> {
        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        let height = self.context.height;
        let round = self.context.round;

        let proposal = match &self.context.own_proposal {
            Some((r, proposal)) if *r == round => proposal.clone(),
            _ => {
                let valid = self.context.valid.and_then(|v| {
                    self.context
                        .blocks
                        .get(&v.block_hash)
                        .map(|block| (v.round, block.clone()))
                });
                let proposal = match valid {
                    Some((valid_round, block)) => BlockProposal::new(block, Some(valid_round)),
                    None => BlockProposal::new(self.build_block(me), None),
                };
                self.context.own_proposal = Some((round, proposal.clone()));
                self.persist()?;
                proposal
            }
        };

        let block_hash = proposal.block.hash();
        info!(
            height,
            round,
            hash = %block_hash,
            txs = proposal.block.transactions.len(),
            valid_round = ?proposal.valid_round,
            "Proposing block"
        );

        self.context
            .blocks
            .insert(block_hash, proposal.block.clone());
        self.context.proposals.insert(round, proposal.clone());
        self.context.step = Step::Collecting;

        let valid_round = proposal.valid_round;
        let message = ConsensusMessage::new(height, round, me, ConsensusPayload::Proposal(proposal))
            .sign(&self.keypair);
        self.broadcast(message)?;

        self.try_endorse(round, block_hash, valid_round)
    }

    fn build_block(&self, me: u32) -> Block {
        let height = self.context.height;
        let transactions: Vec<Transaction> = self
            .txpool
            .pending_transactions(self.config.max_block_transactions)
            .into_iter()
            .filter(|tx| self.txpool.validate_transaction(tx))
            .collect();
        let (vrf_value, vrf_proof) = vrf::prove(
            &self.keypair,
            &vrf_input(&self.context.parent.vrf_value, height),
        );

        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: self.context.parent_hash,
                height,
                timestamp: self.now.max(self.context.parent.timestamp + 1),
                tx_root: compute_tx_root(&transactions),
                proposer: me,
                vrf_value,
                vrf_proof,
            },
            transactions,
        }
    }

    /// Handles a proposal for the current round
    fn on_proposal(&mut self, sender: u32, proposal: BlockProposal) -> ConsensusResult<()> {
        let height = self.context.height;
        let round = self.context.round;
        let Some(expected) = self.context.leader(round) else {
            return Ok(());
        };
        if sender != expected {
            return Err(ConsensusError::WrongLeader {
                expected,
                got: sender,
            });
        }

        let block_hash = proposal.block.hash();
        if let Some(existing) = self.context.proposals.get(&round) {
            let existing_hash = existing.block.hash();
            if existing_hash == block_hash {
                return Ok(());
            }
            warn!(height, round, leader = sender, "Leader proposed two different blocks");
            return self.report_equivocation(Equivocation {
                height,
                round,
                sender,
                kind: ConsensusMessageType::Proposal,
                first: existing_hash,
                second: block_hash,
            });
        }

        self.validate_proposal(sender, &proposal)?;

        info!(
            height,
            round,
            leader = sender,
            hash = %block_hash,
            txs = proposal.block.transactions.len(),
            "Received proposal"
        );

        let valid_round = proposal.valid_round;
        self.context
            .blocks
            .insert(block_hash, proposal.block.clone());
        self.context.proposals.insert(round, proposal);

        self.try_endorse(round, block_hash, valid_round)?;
        self.check_endorse_quorum(round)?;
        self.check_commit_quorum(round)
    }

    /// Fail-closed block checks against the parent
    fn validate_proposal(&self, sender: u32, proposal: &BlockProposal) -> ConsensusResult<()> {
        let block = &proposal.block;
        let header = &block.header;
        block.validate_structure(self.config.max_block_transactions)?;

        if header.height != self.context.height {
            return Err(ConsensusError::invalid_proposal(format!(
                "block height {} at consensus height {}",
                header.height, self.context.height
            )));
        }
        if header.prev_hash != self.context.parent_hash {
            return Err(ConsensusError::invalid_proposal("block does not extend the tip"));
        }
        if header.timestamp <= self.context.parent.timestamp {
            return Err(ConsensusError::invalid_proposal(
                "timestamp not after parent block",
            ));
        }
        match proposal.valid_round {
            None if header.proposer != sender => {
                return Err(ConsensusError::invalid_proposal("proposer is not the sender"));
            }
            Some(valid_round) if valid_round >= self.context.round => {
                return Err(ConsensusError::invalid_proposal(format!(
                    "valid round {} not before round {}",
                    valid_round, self.context.round
                )));
            }
            Some(valid_round) if header.proposer != sender => {
                // A block carried over from an earlier round must be one
                // this node saw proposed or endorsed by a quorum there.
                let block_hash = block.hash();
                let seen = self
                    .context
                    .proposals
                    .get(&valid_round)
                    .map_or(false, |p| p.block.hash() == block_hash)
                    || self.context.votes.has_quorum(
                        valid_round,
                        ConsensusMessageType::Endorse,
                        &block_hash,
                        self.context.quorum,
                    );
                if !seen {
                    return Err(ConsensusError::invalid_proposal(format!(
                        "re-proposed block {} unknown at valid round {}",
                        block_hash, valid_round
                    )));
                }
            }
            _ => {}
        }

        let proposer_key = self
            .pool
            .get_peer_vrf_key(header.proposer)
            .ok_or(ConsensusError::UnknownPeer(header.proposer))?;
        let output = vrf::verify(
            &proposer_key,
            &vrf_input(&self.context.parent.vrf_value, header.height),
            &header.vrf_proof,
        )?;
        if output != header.vrf_value {
            return Err(ConsensusError::invalid_proposal("VRF value does not match proof"));
        }

        if let Some(tx) = block
            .transactions
            .iter()
            .find(|tx| !self.txpool.validate_transaction(tx))
        {
            return Err(ConsensusError::invalid_proposal(format!(
                "invalid transaction {}",
                tx.hash()
            )));
        }
        Ok(())
    }

    /// Endorses unless locked on a different block that the proposal does
    /// not justify abandoning
    fn try_endorse(
        &mut self,
        round: u32,
        block_hash: Hash256,
        valid_round: Option<u32>,
    ) -> ConsensusResult<()> {
        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        if self.context.step != Step::Collecting
            || self
                .context
                .votes
                .vote_of(round, ConsensusMessageType::Endorse, me)
                .is_some()
        {
            return Ok(());
        }

        if let Some(lock) = self.context.locked {
            let unlocks = valid_round.map_or(false, |vr| {
                vr >= lock.round
                    && self.context.votes.has_quorum(
                        vr,
                        ConsensusMessageType::Endorse,
                        &block_hash,
                        self.context.quorum,
                    )
            });
            if lock.block_hash != block_hash && !unlocks {
                info!(
                    height = self.context.height,
                    round,
                    locked_round = lock.round,
                    "Locked on another block, withholding endorsement"
                );
                return Ok(());
            }
        }

        self.cast_vote(ConsensusMessageType::Endorse, round, block_hash)
    }

    fn cast_vote(
        &mut self,
        kind: ConsensusMessageType,
        round: u32,
        block_hash: Hash256,
    ) -> ConsensusResult<()> {
        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        self.context.votes.add(round, kind, me, block_hash);
        self.persist()?;

        debug!(
            height = self.context.height,
            round,
            kind = %kind,
            hash = %block_hash,
            "Casting vote"
        );
        let payload = match kind {
            ConsensusMessageType::Commit => ConsensusPayload::Commit(Vote::new(block_hash)),
            _ => ConsensusPayload::Endorse(Vote::new(block_hash)),
        };
        let message =
            ConsensusMessage::new(self.context.height, round, me, payload).sign(&self.keypair);
        self.broadcast(message)?;

        match kind {
            ConsensusMessageType::Commit => self.check_commit_quorum(round),
            _ => self.check_endorse_quorum(round),
        }
    }

    fn on_vote(
        &mut self,
        kind: ConsensusMessageType,
        round: u32,
        sender: u32,
        block_hash: Hash256,
    ) -> ConsensusResult<()> {
        match self.context.votes.add(round, kind, sender, block_hash) {
            VoteOutcome::Duplicate => Ok(()),
            VoteOutcome::Equivocation(evidence) => self.report_equivocation(evidence),
            VoteOutcome::Added => {
                debug!(
                    height = self.context.height,
                    round,
                    validator = sender,
                    kind = %kind,
                    votes = self.context.votes.count(round, kind, &block_hash),
                    "Received vote"
                );
                match kind {
                    ConsensusMessageType::Commit => self.check_commit_quorum(round),
                    _ => self.check_endorse_quorum(round),
                }
            }
        }
    }

    /// On an endorsement quorum: track the valid block, and in the current
    /// round lock on it and commit
    fn check_endorse_quorum(&mut self, round: u32) -> ConsensusResult<()> {
        let Some(block_hash) =
            self.context
                .votes
                .quorum_hash(round, ConsensusMessageType::Endorse, self.context.quorum)
        else {
            return Ok(());
        };
        if !self.context.blocks.contains_key(&block_hash) {
            debug!(round, hash = %block_hash, "Endorsement quorum for a block not yet received");
            return Ok(());
        }

        if self.context.valid.map_or(true, |v| v.round < round) {
            self.context.valid = Some(RoundValue { round, block_hash });
        }

        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        if round != self.context.round
            || self.context.step != Step::Collecting
            || self
                .context
                .votes
                .vote_of(round, ConsensusMessageType::Commit, me)
                .is_some()
        {
            return Ok(());
        }

        info!(
            height = self.context.height,
            round,
            hash = %block_hash,
            "Endorsement quorum reached, locking block"
        );
        self.context.locked = Some(RoundValue { round, block_hash });
        self.cast_vote(ConsensusMessageType::Commit, round, block_hash)
    }

    fn check_commit_quorum(&mut self, round: u32) -> ConsensusResult<()> {
        if self.context.decision.is_some() {
            return Ok(());
        }
        let Some(block_hash) =
            self.context
                .votes
                .quorum_hash(round, ConsensusMessageType::Commit, self.context.quorum)
        else {
            return Ok(());
        };
        if !self.context.blocks.contains_key(&block_hash) {
            debug!(round, hash = %block_hash, "Commit quorum for a block not yet received");
            return Ok(());
        }
        self.finalize(round, block_hash)
    }

    fn finalize(&mut self, round: u32, block_hash: Hash256) -> ConsensusResult<()> {
        let height = self.context.height;
        self.context.decision = Some(RoundValue { round, block_hash });
        self.context.step = Step::Finalizing;

        info!(height, round, hash = %block_hash, "Block finalized");
        counter!("vbft_blocks_finalized_total", 1);

        self.send_event(ConsensusEvent::BlockFinalized {
            height,
            round,
            block_hash,
        })?;
        self.request_append()
    }

    fn request_append(&mut self) -> ConsensusResult<()> {
        let Some(decision) = self.context.decision else {
            return Ok(());
        };
        let Some(block) = self.context.blocks.get(&decision.block_hash).cloned() else {
            return Ok(());
        };
        self.append_in_flight = true;
        self.send_event(ConsensusEvent::AppendBlock {
            height: self.context.height,
            block,
        })
    }

    fn commit_height(&mut self, block_hash: Hash256) -> ConsensusResult<()> {
        let Some(block) = self.context.blocks.get(&block_hash).cloned() else {
            return Ok(());
        };
        let height = self.context.height;
        self.context.step = Step::Committed;
        self.txpool.remove_transactions(&block.transactions);
        self.last_finalized_hash = Some(block_hash);
        self.last_progress = self.now;
        self.stalled = false;
        gauge!("vbft_consensus_last_progress_ms", self.now as f64);

        info!(
            height,
            hash = %block_hash,
            txs = block.transactions.len(),
            "Block committed"
        );
        self.send_event(ConsensusEvent::BlockCommitted { height, block_hash })?;

        if let Some(config) = self.pending_config.take() {
            self.apply_config(config)?;
        }
        self.begin_height(&block.header)
    }

    fn on_round_timeout(&mut self) -> ConsensusResult<()> {
        let height = self.context.height;
        let round = self.context.round;
        let leader = self.context.leader(round);

        warn!(height, round, leader = ?leader, "Round timed out");
        counter!("vbft_round_timeouts_total", 1);
        self.send_event(ConsensusEvent::RoundTimeout {
            height,
            round,
            leader,
        })?;

        let active_peers = self.pool.get_active_peer_count();
        self.stalled = false;
        if let Err(err) = self.quorum_reachable(active_peers) {
            self.stalled = true;
            warn!(height, round, active_peers, error = %err, "Height stalled");
            self.send_event(ConsensusEvent::Stalled {
                height,
                round,
                active_peers,
                quorum: self.context.quorum,
            })?;
        }

        self.send_event(ConsensusEvent::RoundChanged {
            height,
            old_round: round,
            new_round: round + 1,
        })?;
        self.enter_round(round + 1)
    }

    /// Fails with `NoQuorum` when connected members plus this node cannot
    /// form a quorum
    fn quorum_reachable(&self, active_peers: usize) -> ConsensusResult<()> {
        let reachable = active_peers + usize::from(self.context.my_index.is_some());
        if reachable < self.context.quorum {
            return Err(ConsensusError::NoQuorum {
                required: self.context.quorum,
                got: reachable,
            });
        }
        Ok(())
    }

    fn local_status(&self) -> PeerStatus {
        PeerStatus {
            epoch: self.config.epoch,
            committed_height: self.context.height - 1,
            committed_hash: self.context.parent_hash,
            timestamp: self.now,
        }
    }

    fn send_heartbeat(&mut self) -> ConsensusResult<()> {
        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        let message = ConsensusMessage::new(
            self.context.height,
            self.context.round,
            me,
            ConsensusPayload::Heartbeat(self.local_status()),
        )
        .sign(&self.keypair);
        self.broadcast(message)
    }

    fn send_handshake(&mut self, index: u32) -> ConsensusResult<()> {
        let Some(me) = self.context.my_index else {
            return Ok(());
        };
        let message = ConsensusMessage::new(
            self.context.height,
            self.context.round,
            me,
            ConsensusPayload::Handshake(self.local_status()),
        )
        .sign(&self.keypair);
        self.send_event(ConsensusEvent::SendTo { index, message })
    }

    fn report_equivocation(&mut self, evidence: Equivocation) -> ConsensusResult<()> {
        warn!(
            height = evidence.height,
            round = evidence.round,
            validator = evidence.sender,
            kind = %evidence.kind,
            first = %evidence.first,
            second = %evidence.second,
            "Equivocation detected"
        );
        counter!("vbft_equivocations_total", 1);
        self.send_event(ConsensusEvent::Equivocation(evidence))
    }

    fn persist(&self) -> ConsensusResult<()> {
        if let Some(path) = &self.state_path {
            self.context.save(path)?;
        }
        Ok(())
    }

    fn broadcast(&self, message: SignedMessage) -> ConsensusResult<()> {
        self.send_event(ConsensusEvent::Broadcast(message))
    }

    fn send_event(&self, event: ConsensusEvent) -> ConsensusResult<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| ConsensusError::ChannelError(e.to_string()))
    }
}

fn tip_of(ledger: &dyn Ledger) -> ConsensusResult<Block> {
    let height = ledger.current_height();
    ledger
        .block_by_height(height)
        .ok_or(ConsensusError::LedgerUnavailable {
            height,
            attempts: 0,
        })
}
