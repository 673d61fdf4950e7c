//! Consensus message type identifiers.

use serde::{Deserialize, Serialize};

/// Wire tag carried in the first byte of every consensus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConsensusMessageType {
    /// Handshake sent to a newly connected peer
    Handshake = 0x01,
    /// Periodic liveness message
    Heartbeat = 0x02,
    /// Block proposal from the round leader
    Proposal = 0x10,
    /// First-phase vote for a proposed block
    Endorse = 0x20,
    /// Second-phase vote, cast after an endorsement quorum
    Commit = 0x21,
}

impl ConsensusMessageType {
    /// Converts from byte value
    #[must_use]
    pub const fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::Heartbeat),
            0x10 => Some(Self::Proposal),
            0x20 => Some(Self::Endorse),
            0x21 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts to byte value
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for endorse and commit votes
    #[must_use]
    pub const fn is_vote(self) -> bool {
        matches!(self, Self::Endorse | Self::Commit)
    }

    /// Returns the string representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::Heartbeat => "Heartbeat",
            Self::Proposal => "Proposal",
            Self::Endorse => "Endorse",
            Self::Commit => "Commit",
        }
    }
}

impl std::fmt::Display for ConsensusMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
