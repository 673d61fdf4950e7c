//! Deterministic in-process committee for integration tests.
//!
//! Every validator runs a real [`ConsensusService`]. Messages travel as wire
//! bytes through a FIFO queue, ledger appends complete synchronously and
//! time only moves when a test calls [`Committee::advance`].

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use vbft_config::{ChainConfig, NodeId, PeerConfig, VrfKey};
use vbft_consensus::messages::HEADER_SIZE;
use vbft_consensus::{
    decode_verified, Block, ConsensusCommand, ConsensusEvent, ConsensusMessage,
    ConsensusMessageType, ConsensusPayload, ConsensusResult, ConsensusService, Ledger,
    MemoryLedger, MemoryTxPool, PeerPool, SessionMode, SignedMessage, Vote,
};
use vbft_cryptography::{Hash256, KeyPair};

/// Start time of every simulation (ms)
pub const START_TIME: u64 = 1_000;

/// Routes tracing output through the test harness; `RUST_LOG` selects levels
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn keypair(index: u32) -> KeyPair {
    KeyPair::from_seed([index as u8 + 1; 32])
}

/// Committee slot for `keypair`
pub fn peer_config(index: u32, keypair: &KeyPair) -> PeerConfig {
    PeerConfig {
        index,
        id: NodeId::from_public_key(&keypair.public_key().to_bytes()),
        vrf_key: VrfKey::from_bytes(&keypair.vrf_public_key().to_bytes()),
    }
}

pub fn create_test_validators(count: u32) -> (ChainConfig, Vec<KeyPair>) {
    let keys: Vec<KeyPair> = (0..count).map(keypair).collect();
    let peers = keys
        .iter()
        .enumerate()
        .map(|(i, k)| peer_config(i as u32, k))
        .collect();
    (ChainConfig::for_testing(peers), keys)
}

/// Signs an endorse or commit vote as `sender`
pub fn signed_vote(
    sender: u32,
    height: u32,
    round: u32,
    kind: ConsensusMessageType,
    block_hash: Hash256,
) -> SignedMessage {
    let payload = match kind {
        ConsensusMessageType::Commit => ConsensusPayload::Commit(Vote::new(block_hash)),
        _ => ConsensusPayload::Endorse(Vote::new(block_hash)),
    };
    ConsensusMessage::new(height, round, sender, payload).sign(&keypair(sender))
}

/// One validator and its in-memory collaborators
pub struct Node {
    pub index: u32,
    pub service: ConsensusService,
    pub ledger: Arc<MemoryLedger>,
    pub txpool: Arc<MemoryTxPool>,
    pub pool: Arc<PeerPool>,
    events: mpsc::Receiver<ConsensusEvent>,
    /// Every event emitted so far
    pub log: Vec<ConsensusEvent>,
}

impl Node {
    pub fn new(index: u32, config: &ChainConfig, genesis: &Block) -> Self {
        Self::build(index, config, genesis, None)
    }

    /// A node persisting its lock and votes at `path`
    pub fn with_state_path(
        index: u32,
        config: &ChainConfig,
        genesis: &Block,
        path: &std::path::Path,
    ) -> Self {
        Self::build(index, config, genesis, Some(path))
    }

    fn build(
        index: u32,
        config: &ChainConfig,
        genesis: &Block,
        path: Option<&std::path::Path>,
    ) -> Self {
        let ledger = Arc::new(MemoryLedger::new(genesis.clone()));
        let txpool = Arc::new(MemoryTxPool::new());
        let pool = Arc::new(PeerPool::from_config(config).unwrap());
        let (event_tx, events) = mpsc::channel(100_000);
        let service = ConsensusService::new(
            config.clone(),
            keypair(index),
            pool.clone(),
            ledger.clone(),
            txpool.clone(),
            event_tx,
        )
        .unwrap();
        let service = match path {
            Some(path) => service.with_state_path(path),
            None => service,
        };

        Self {
            index,
            service,
            ledger,
            txpool,
            pool,
            events,
            log: Vec::new(),
        }
    }

    /// Takes the events emitted since the last call
    pub fn drain(&mut self) -> Vec<ConsensusEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            self.log.push(event.clone());
            drained.push(event);
        }
        drained
    }

    /// Decodes, verifies and processes wire bytes
    pub fn receive(&mut self, bytes: &[u8]) -> ConsensusResult<()> {
        let message = decode_verified(bytes, &self.pool)?;
        self.service.process_message(message)
    }

    pub fn deliver(&mut self, message: &SignedMessage) -> ConsensusResult<()> {
        self.receive(&message.encode())
    }

    /// `(height, round, hash)` of every finalization
    pub fn finalized(&self) -> Vec<(u32, u32, Hash256)> {
        self.log
            .iter()
            .filter_map(|event| match event {
                ConsensusEvent::BlockFinalized {
                    height,
                    round,
                    block_hash,
                } => Some((*height, *round, *block_hash)),
                _ => None,
            })
            .collect()
    }

    pub fn count_events(&self, pred: impl Fn(&ConsensusEvent) -> bool) -> usize {
        self.log.iter().filter(|event| pred(event)).count()
    }

    pub fn height(&self) -> u32 {
        self.ledger.current_height()
    }
}

/// A committee wired together through an in-memory message queue
pub struct Committee {
    pub config: ChainConfig,
    pub genesis: Block,
    pub nodes: Vec<Node>,
    pub now: u64,
    /// Members whose messages are neither sent nor received
    pub isolated: HashSet<u32>,
    /// Members whose outbound messages get one payload byte flipped
    pub corrupted: HashSet<u32>,
    /// Deliveries rejected during decoding or verification
    pub rejected: usize,
    queue: VecDeque<(u32, Option<u32>, Vec<u8>)>,
}

impl Committee {
    pub fn new(size: u32) -> Self {
        let (config, _) = create_test_validators(size);
        Self::with_config(config)
    }

    pub fn with_config(config: ChainConfig) -> Self {
        init_tracing();
        let genesis = Block::genesis(&config);
        let nodes = config
            .peers
            .iter()
            .map(|peer| Node::new(peer.index, &config, &genesis))
            .collect();
        Self {
            config,
            genesis,
            nodes,
            now: START_TIME,
            isolated: HashSet::new(),
            corrupted: HashSet::new(),
            rejected: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn node(&self, index: u32) -> &Node {
        &self.nodes[index as usize]
    }

    pub fn node_mut(&mut self, index: u32) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    /// Starts every member, connects reachable pairs and settles messages
    pub fn start(&mut self) {
        let now = self.now;
        for node in &mut self.nodes {
            node.service
                .handle(ConsensusCommand::Start { timestamp: now })
                .unwrap();
        }

        let size = self.nodes.len() as u32;
        for i in 0..size {
            for j in (0..size).filter(|j| *j != i) {
                if self.isolated.contains(&i) || self.isolated.contains(&j) {
                    continue;
                }
                let node = self.node_mut(i);
                node.pool.peer_connected(j, SessionMode::Fresh).unwrap();
                node.service
                    .handle(ConsensusCommand::PeerConnected { index: j })
                    .unwrap();
            }
        }
        self.pump();
    }

    /// Cuts a member off and tells everyone the links dropped
    pub fn isolate(&mut self, index: u32) {
        self.isolated.insert(index);
        for node in &self.nodes {
            if node.index == index {
                for peer in self.nodes.iter().filter(|n| n.index != index) {
                    node.pool.peer_disconnected(peer.index).unwrap();
                }
            } else {
                node.pool.peer_disconnected(index).unwrap();
            }
        }
    }

    /// Moves the clock forward and ticks every member
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        let now = self.now;
        for i in 0..self.nodes.len() {
            let _ = self.nodes[i]
                .service
                .handle(ConsensusCommand::Tick { timestamp: now });
            self.pump();
        }
    }

    /// Advances in `step` increments until `done` holds or `limit` ms pass.
    /// Returns whether `done` held.
    pub fn run_until(&mut self, step: u64, limit: u64, done: impl Fn(&Committee) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.advance(step);
        }
        done(self)
    }

    /// Routes queued events and messages until the committee is quiet
    pub fn pump(&mut self) {
        for _ in 0..1_000_000 {
            self.collect_events();
            let Some((from, to, bytes)) = self.queue.pop_front() else {
                return;
            };
            if self.isolated.contains(&from) {
                continue;
            }
            let targets: Vec<u32> = self
                .nodes
                .iter()
                .map(|n| n.index)
                .filter(|index| *index != from && !self.isolated.contains(index))
                .filter(|index| to.map_or(true, |to| *index == to))
                .collect();
            for target in targets {
                if let Err(e) = self.node_mut(target).receive(&bytes) {
                    if matches!(
                        e,
                        vbft_consensus::ConsensusError::MalformedMessage { .. }
                            | vbft_consensus::ConsensusError::BadSignature { .. }
                    ) {
                        self.rejected += 1;
                    }
                }
            }
        }
        panic!("committee did not settle");
    }

    fn collect_events(&mut self) {
        for i in 0..self.nodes.len() {
            let from = self.nodes[i].index;
            for event in self.nodes[i].drain() {
                match event {
                    ConsensusEvent::Broadcast(message) => {
                        let bytes = self.wire(from, &message);
                        self.queue.push_back((from, None, bytes));
                    }
                    ConsensusEvent::SendTo { index, message } => {
                        let bytes = self.wire(from, &message);
                        self.queue.push_back((from, Some(index), bytes));
                    }
                    ConsensusEvent::AppendBlock { height, block } => {
                        let node = &mut self.nodes[i];
                        let block_hash = block.hash();
                        let result = node.ledger.add_block(block);
                        let _ = node.service.handle(ConsensusCommand::LedgerAppended {
                            height,
                            block_hash,
                            result,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    fn wire(&self, from: u32, message: &SignedMessage) -> Vec<u8> {
        let mut bytes = message.encode();
        if self.corrupted.contains(&from) {
            bytes[HEADER_SIZE] ^= 0x01;
        }
        bytes
    }

    /// Members outside the isolated set
    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(move |n| !self.isolated.contains(&n.index))
    }

    /// Lowest ledger height among live members
    pub fn min_live_height(&self) -> u32 {
        self.live_nodes().map(Node::height).min().unwrap_or(0)
    }
}
