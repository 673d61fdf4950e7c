//! Error types for consensus operations.
//!
//! Per-message errors are logged and the message dropped; they never abort
//! the state machine. Only [`ConsensusError::LedgerUnavailable`] and
//! channel failures are escalated to the process.
//!
//! ## Error Categories
//!
//! | Error | Description |
//! |-------|-------------|
//! | `MalformedMessage` | Decode or structural failure |
//! | `BadSignature` | Signature did not verify |
//! | `UnknownPeer` | Sender is not a committee member |
//! | `StaleRound` / `StaleHeight` | Message for a superseded round or height |
//! | `NoQuorum` | Too few members reachable; the height stalls |
//! | `LedgerAppendFailed` | Finalized block could not be appended; retried |
//!
//! ## Example
//!
//! ```rust
//! use vbft_consensus::ConsensusError;
//!
//! let err = ConsensusError::malformed("trailing bytes");
//! assert!(err.to_string().contains("Malformed message"));
//! assert!(err.is_droppable());
//! ```

use thiserror::Error;
use vbft_config::ConfigError;
use vbft_cryptography::CryptoError;

/// Errors that can occur during consensus operations.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Bytes could not be decoded into a well-formed message.
    #[error("Malformed message: {message}")]
    MalformedMessage {
        /// Error message.
        message: String,
    },

    /// Signature did not verify against the sender's key.
    #[error("Bad signature from validator {sender}")]
    BadSignature {
        /// Claimed sender index.
        sender: u32,
    },

    /// Sender is not a member of the current committee.
    #[error("Unknown peer: {0}")]
    UnknownPeer(u32),

    /// Message for a round that has already been left.
    #[error("Stale round: current {current}, got {got}")]
    StaleRound {
        /// Current round.
        current: u32,
        /// Round carried by the message.
        got: u32,
    },

    /// Message for a height that has already been decided.
    #[error("Stale height: current {current}, got {got}")]
    StaleHeight {
        /// Current height.
        current: u32,
        /// Height carried by the message.
        got: u32,
    },

    /// Too few committee members reachable to form a quorum.
    #[error("No quorum: required {required}, got {got}")]
    NoQuorum {
        /// Members needed.
        required: usize,
        /// Members reachable, this node included.
        got: usize,
    },

    /// The ledger rejected or failed to store a finalized block.
    #[error("Ledger append failed at height {height}: {message}")]
    LedgerAppendFailed {
        /// Height of the block.
        height: u32,
        /// Error message.
        message: String,
    },

    /// The ledger kept failing; no further progress is possible.
    #[error("Ledger unavailable at height {height} after {attempts} attempts")]
    LedgerUnavailable {
        /// Height that could not be appended.
        height: u32,
        /// Number of consecutive failed attempts.
        attempts: u32,
    },

    /// Proposal was not sent by the leader of its round.
    #[error("Wrong leader: expected {expected}, got {got}")]
    WrongLeader {
        /// Expected leader index.
        expected: u32,
        /// Actual sender index.
        got: u32,
    },

    /// Proposal carries a structurally invalid block.
    #[error("Invalid block proposal: {message}")]
    InvalidProposal {
        /// Error message.
        message: String,
    },

    /// Node id in the committee configuration does not decode to a key.
    #[error("Invalid key for peer {index}: {message}")]
    InvalidPeerKey {
        /// Committee index.
        index: u32,
        /// Error message.
        message: String,
    },

    /// Local key is not part of the committee.
    #[error("Not a validator")]
    NotValidator,

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Persistence error.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bincode serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ConsensusError {
    /// Create a malformed message error.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create an invalid proposal error.
    pub fn invalid_proposal<S: Into<String>>(message: S) -> Self {
        Self::InvalidProposal {
            message: message.into(),
        }
    }

    /// Returns true for per-message errors that only warrant dropping the
    /// offending message.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage { .. }
                | Self::BadSignature { .. }
                | Self::UnknownPeer(_)
                | Self::StaleRound { .. }
                | Self::StaleHeight { .. }
                | Self::NoQuorum { .. }
                | Self::WrongLeader { .. }
                | Self::InvalidProposal { .. }
        )
    }
}

impl From<CryptoError> for ConsensusError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidVrfProof => Self::invalid_proposal("VRF proof does not verify"),
            other => Self::malformed(other.to_string()),
        }
    }
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;
