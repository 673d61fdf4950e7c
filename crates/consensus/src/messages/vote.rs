//! Endorse and commit vote payload.

use crate::codec::{BinaryWriter, MemoryReader, Serializable};
use crate::ConsensusResult;
use vbft_cryptography::Hash256;

/// A vote for a block hash. Whether it endorses or commits is carried by
/// the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vote {
    pub block_hash: Hash256,
}

impl Vote {
    pub fn new(block_hash: Hash256) -> Self {
        Self { block_hash }
    }
}

impl Serializable for Vote {
    fn size(&self) -> usize {
        Hash256::LEN
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        writer.write_bytes(self.block_hash.as_bytes());
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        Ok(Self {
            block_hash: Hash256(reader.read_array()?),
        })
    }
}
