//! Handshake and heartbeat payload.

use crate::codec::{BinaryWriter, MemoryReader, Serializable};
use crate::ConsensusResult;
use vbft_cryptography::Hash256;

/// A member's view of the chain, sent in handshakes and heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    /// Committee epoch the sender is running.
    pub epoch: u32,
    /// Highest height the sender has committed.
    pub committed_height: u32,
    /// Hash of that block.
    pub committed_hash: Hash256,
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Serializable for PeerStatus {
    fn size(&self) -> usize {
        4 + 4 + 32 + 8
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.epoch);
        writer.write_u32(self.committed_height);
        writer.write_bytes(self.committed_hash.as_bytes());
        writer.write_u64(self.timestamp);
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        Ok(Self {
            epoch: reader.read_u32()?,
            committed_height: reader.read_u32()?,
            committed_hash: Hash256(reader.read_array()?),
            timestamp: reader.read_u64()?,
        })
    }
}
