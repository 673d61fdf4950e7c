//! Block proposal payload.

use crate::block::Block;
use crate::codec::{BinaryWriter, MemoryReader, Serializable, SerializableExt};
use crate::ConsensusResult;
use vbft_cryptography::{domain_hash, Hash256};

const PROPOSAL_DOMAIN: &[u8] = b"VBFT/proposal/v1";

/// A candidate block from the round leader.
///
/// `valid_round` is set when the leader re-proposes a block it saw reach an
/// endorsement quorum in that earlier round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockProposal {
    pub block: Block,
    pub valid_round: Option<u32>,
}

impl BlockProposal {
    pub fn new(block: Block, valid_round: Option<u32>) -> Self {
        Self { block, valid_round }
    }

    /// Committee index of the proposer, taken from the block header.
    pub fn proposer(&self) -> u32 {
        self.block.header.proposer
    }

    /// Domain-separated proposal hash; never equal to the block hash.
    pub fn hash(&self) -> Hash256 {
        hash_proposal(self)
    }
}

/// Hashes a proposal under its own domain tag so that proposal digests
/// cannot be mistaken for block identities.
pub fn hash_proposal(proposal: &BlockProposal) -> Hash256 {
    domain_hash(PROPOSAL_DOMAIN, &proposal.to_array())
}

impl Serializable for BlockProposal {
    fn size(&self) -> usize {
        self.block.size() + if self.valid_round.is_some() { 5 } else { 1 }
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        self.block.serialize(writer);
        writer.write_optional_u32(self.valid_round);
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        Ok(Self {
            block: Block::deserialize(reader)?,
            valid_round: reader.read_optional_u32()?,
        })
    }
}
