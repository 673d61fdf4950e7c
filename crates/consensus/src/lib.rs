//! # VBFT Consensus
//!
//! Verifiable-random-function Byzantine Fault Tolerant consensus.
//!
//! A fixed committee of `n` validators agrees on one block per height and
//! tolerates `f = (n-1)/3` Byzantine members. Each round has a single
//! leader drawn from a schedule seeded by the parent block's VRF output.
//!
//! ## Core Types
//!
//! - [`PeerPool`]: committee membership, connection state and liveness
//! - [`SignedMessage`]: wire codec for consensus messages
//! - [`ConsensusService`]: the per-height state machine
//! - [`ConsensusRunner`]: async driver wiring the service to a [`Network`],
//!   a [`Ledger`] and a timer
//!
//! ## Consensus Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    VBFT Round Flow                           │
//! │                                                              │
//! │  Leader                     Validators                       │
//! │    │                           │                             │
//! │    │──── Proposal (VRF) ──────>│                             │
//! │    │                           │                             │
//! │    │<───────── Endorse ────────│  2f+1 endorsements: lock    │
//! │    │                           │                             │
//! │    │<────────── Commit ────────│  2f+1 commits: finalize     │
//! │    │                           │                             │
//! │    │       Block appended      │                             │
//! │    ▼                           ▼                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use vbft_consensus::ConsensusMessageType;
//!
//! let msg_type = ConsensusMessageType::from_byte(0x20);
//! assert_eq!(msg_type, Some(ConsensusMessageType::Endorse));
//! assert!(ConsensusMessageType::Commit.is_vote());
//! ```

pub mod block;
pub mod codec;
pub mod context;
pub mod error;
pub mod leader;
pub mod ledger;
pub mod message_type;
pub mod messages;
pub mod network;
pub mod peer_pool;
pub mod runner;
pub mod service;
pub mod txpool;
pub mod votes;

// Re-exports
pub use block::{Block, BlockHeader, Transaction};
pub use context::{ConsensusContext, RoundValue, Step};
pub use error::{ConsensusError, ConsensusResult};
pub use leader::{leader_schedule, select_leader};
pub use ledger::{Ledger, MemoryLedger};
pub use message_type::ConsensusMessageType;
pub use messages::{
    decode_verified, sign_message, verify_message, verify_signed, BlockProposal, ConsensusMessage,
    ConsensusPayload, PeerStatus, SignedMessage, VerifiedMessage, Vote,
};
pub use network::{LocalNetwork, Network};
pub use peer_pool::{Peer, PeerPool, SessionMode};
pub use runner::{ConsensusHandle, ConsensusRunner};
pub use service::{ConsensusCommand, ConsensusEvent, ConsensusService, ConsensusStatus};
pub use txpool::{MemoryTxPool, TxPool};
pub use votes::{Equivocation, VoteOutcome, VoteTally};

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
