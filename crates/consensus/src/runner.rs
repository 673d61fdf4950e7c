//! Async driver for the consensus service.
//!
//! The runner owns the [`ConsensusService`] and is the single consumer of
//! its command queue. Timer ticks, verified inbound messages and ledger
//! append results all arrive on that queue, so state transitions are
//! serialized without locks. [`ConsensusHandle`] is the cloneable entry
//! point for the network adapter and RPC layer.

use crate::block::Block;
use crate::ledger::Ledger;
use crate::messages::{
    decode_verified, verify_signed, ConsensusPayload, SignedMessage, VerifiedMessage,
};
use crate::network::Network;
use crate::peer_pool::{PeerPool, SessionMode};
use crate::service::{ConsensusCommand, ConsensusEvent, ConsensusService, ConsensusStatus};
use crate::txpool::TxPool;
use crate::{current_timestamp, ConsensusError, ConsensusMessageType, ConsensusResult};
use metrics::counter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use vbft_config::ChainConfig;
use vbft_cryptography::KeyPair;

/// Capacity of the command queue
pub const COMMAND_QUEUE_SIZE: usize = 4_096;

/// Capacity of the service event queue and the observer channel
pub const EVENT_QUEUE_SIZE: usize = 4_096;

/// Default timer resolution
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Runs one validator's consensus until stopped
pub struct ConsensusRunner {
    service: ConsensusService,
    commands_tx: mpsc::Sender<ConsensusCommand>,
    commands_rx: mpsc::Receiver<ConsensusCommand>,
    events_rx: mpsc::Receiver<ConsensusEvent>,
    events: broadcast::Sender<ConsensusEvent>,
    status_tx: watch::Sender<ConsensusStatus>,
    ledger: Arc<dyn Ledger>,
    network: Arc<dyn Network>,
    tick_interval: Duration,
    append_timeout: Duration,
}

impl ConsensusRunner {
    /// Builds a runner and the handle used to feed it
    pub fn new(
        config: ChainConfig,
        keypair: KeyPair,
        ledger: Arc<dyn Ledger>,
        txpool: Arc<dyn TxPool>,
        network: Arc<dyn Network>,
    ) -> ConsensusResult<(Self, ConsensusHandle)> {
        let pool = Arc::new(PeerPool::from_config(&config)?);
        let append_timeout = Duration::from_millis(config.ledger_append_timeout_msec);

        let (event_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let service = ConsensusService::new(
            config,
            keypair,
            pool.clone(),
            ledger.clone(),
            txpool,
            event_tx,
        )?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (status_tx, status_rx) = watch::channel(service.status());
        let (events, _) = broadcast::channel(EVENT_QUEUE_SIZE);

        let handle = ConsensusHandle {
            index: service.my_index(),
            pool,
            commands: commands_tx.clone(),
            status: status_rx,
            events: events.clone(),
        };

        let runner = Self {
            service,
            commands_tx,
            commands_rx,
            events_rx,
            events,
            status_tx,
            ledger,
            network,
            tick_interval: DEFAULT_TICK_INTERVAL,
            append_timeout,
        };
        Ok((runner, handle))
    }

    /// Persists lock and vote state at `path`
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.service = self.service.with_state_path(path);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Runs until `stop` is requested. Returns an error only when the node
    /// cannot make progress at all.
    pub async fn run(mut self) -> ConsensusResult<()> {
        self.service.start(current_timestamp())?;
        self.drain_events().await;
        self.publish_status();

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let command = tokio::select! {
                Some(command) = self.commands_rx.recv() => command,
                _ = ticker.tick() => ConsensusCommand::Tick { timestamp: current_timestamp() },
            };
            let stop = matches!(command, ConsensusCommand::Stop);

            let result = self.service.handle(command);
            self.drain_events().await;
            self.publish_status();

            match result {
                Ok(()) => {}
                Err(e) if e.is_droppable() => {
                    debug!(target: "vbft::runner", error = %e, "Dropped consensus message");
                    counter!("vbft_messages_dropped_total", 1);
                }
                Err(e @ ConsensusError::LedgerUnavailable { .. })
                | Err(e @ ConsensusError::ChannelError(_)) => {
                    error!(target: "vbft::runner", error = %e, "Consensus cannot make progress");
                    return Err(e);
                }
                Err(e) => warn!(target: "vbft::runner", error = %e, "Consensus command failed"),
            }

            if stop {
                break;
            }
        }

        info!(
            target: "vbft::runner",
            height = self.service.context().height,
            "Consensus runner stopped"
        );
        Ok(())
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.service.status());
    }

    async fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(&event).await;
            // No observers is fine
            let _ = self.events.send(event);
        }
    }

    async fn dispatch(&self, event: &ConsensusEvent) {
        match event {
            ConsensusEvent::Broadcast(message) => {
                if let Err(e) = self.network.broadcast(message.encode()).await {
                    warn!(
                        target: "vbft::runner",
                        msg_type = %message.message.message_type(),
                        error = %e,
                        "Broadcast failed"
                    );
                }
            }
            ConsensusEvent::SendTo { index, message } => {
                if let Err(e) = self.network.send_to(*index, message.encode()).await {
                    debug!(target: "vbft::runner", peer = index, error = %e, "Send failed");
                }
            }
            ConsensusEvent::AppendBlock { height, block } => self.spawn_append(*height, block.clone()),
            _ => {}
        }
    }

    /// Appends off the event loop and reports back through the queue
    fn spawn_append(&self, height: u32, block: Block) {
        let ledger = self.ledger.clone();
        let commands = self.commands_tx.clone();
        let timeout = self.append_timeout;
        let block_hash = block.hash();

        tokio::spawn(async move {
            let append = tokio::task::spawn_blocking(move || ledger.add_block(block));
            let result = match tokio::time::timeout(timeout, append).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(ConsensusError::LedgerAppendFailed {
                    height,
                    message: e.to_string(),
                }),
                Err(_) => Err(ConsensusError::LedgerAppendFailed {
                    height,
                    message: format!("append timed out after {:?}", timeout),
                }),
            };
            let command = ConsensusCommand::LedgerAppended {
                height,
                block_hash,
                result,
            };
            if commands.send(command).await.is_err() {
                debug!(target: "vbft::runner", height, "Runner stopped before append completed");
            }
        });
    }
}

/// Cloneable entry point into a running [`ConsensusRunner`]
#[derive(Clone)]
pub struct ConsensusHandle {
    index: Option<u32>,
    pool: Arc<PeerPool>,
    commands: mpsc::Sender<ConsensusCommand>,
    status: watch::Receiver<ConsensusStatus>,
    events: broadcast::Sender<ConsensusEvent>,
}

impl ConsensusHandle {
    /// Committee index of the local validator
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn pool(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    /// Decodes and verifies raw wire bytes and routes the message
    pub fn on_message(&self, bytes: &[u8]) -> ConsensusResult<()> {
        let message = decode_verified(bytes, &self.pool)?;
        let sender = message.sender();
        match &message.message().payload {
            ConsensusPayload::Handshake(status) => self.pool.peer_handshake(sender, *status),
            ConsensusPayload::Heartbeat(status) => self.pool.peer_heartbeat(sender, *status),
            _ => self.submit(ConsensusCommand::Message(message)),
        }
    }

    pub fn on_handshake(&self, peer_index: u32, message: SignedMessage) -> ConsensusResult<()> {
        self.check_sender(peer_index, &message)?;
        let verified = self.verify_kind(message, |kind| kind == ConsensusMessageType::Handshake)?;
        match &verified.message().payload {
            ConsensusPayload::Handshake(status) => self.pool.peer_handshake(peer_index, *status),
            _ => Ok(()),
        }
    }

    pub fn on_heartbeat(&self, peer_index: u32, message: SignedMessage) -> ConsensusResult<()> {
        self.check_sender(peer_index, &message)?;
        let verified = self.verify_kind(message, |kind| kind == ConsensusMessageType::Heartbeat)?;
        match &verified.message().payload {
            ConsensusPayload::Heartbeat(status) => self.pool.peer_heartbeat(peer_index, *status),
            _ => Ok(()),
        }
    }

    pub fn on_proposal(&self, message: SignedMessage) -> ConsensusResult<()> {
        let verified = self.verify_kind(message, |kind| kind == ConsensusMessageType::Proposal)?;
        self.submit(ConsensusCommand::Message(verified))
    }

    pub fn on_vote(&self, message: SignedMessage) -> ConsensusResult<()> {
        let verified = self.verify_kind(message, ConsensusMessageType::is_vote)?;
        self.submit(ConsensusCommand::Message(verified))
    }

    /// Marks a member connected and sends it our handshake
    pub fn peer_connected(&self, index: u32, mode: SessionMode) -> ConsensusResult<()> {
        self.pool.peer_connected(index, mode)?;
        self.submit(ConsensusCommand::PeerConnected { index })
    }

    pub fn peer_disconnected(&self, index: u32) -> ConsensusResult<()> {
        self.pool.peer_disconnected(index)
    }

    /// Latest published status
    pub fn status(&self) -> ConsensusStatus {
        self.status.borrow().clone()
    }

    /// Receiver of every event the service emits from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Waits for the next status change
    pub async fn changed(&mut self) -> ConsensusResult<ConsensusStatus> {
        self.status
            .changed()
            .await
            .map_err(|e| ConsensusError::ChannelError(e.to_string()))?;
        Ok(self.status.borrow().clone())
    }

    /// Schedules a committee change for the next height boundary
    pub fn reconfigure(&self, config: ChainConfig) -> ConsensusResult<()> {
        self.submit(ConsensusCommand::Reconfigure(config))
    }

    pub fn stop(&self) -> ConsensusResult<()> {
        self.submit(ConsensusCommand::Stop)
    }

    fn check_sender(&self, peer_index: u32, message: &SignedMessage) -> ConsensusResult<()> {
        if message.message.sender != peer_index {
            return Err(ConsensusError::malformed(format!(
                "message from peer {} claims sender {}",
                peer_index, message.message.sender
            )));
        }
        Ok(())
    }

    fn verify_kind(
        &self,
        message: SignedMessage,
        accept: impl Fn(ConsensusMessageType) -> bool,
    ) -> ConsensusResult<VerifiedMessage> {
        let kind = message.message.message_type();
        if !accept(kind) {
            return Err(ConsensusError::malformed(format!(
                "unexpected {} message",
                kind
            )));
        }
        verify_signed(message, &self.pool)
    }

    fn submit(&self, command: ConsensusCommand) -> ConsensusResult<()> {
        self.commands
            .try_send(command)
            .map_err(|e| ConsensusError::ChannelError(e.to_string()))
    }
}

impl std::fmt::Debug for ConsensusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
