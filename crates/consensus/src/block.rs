//! Block model.
//!
//! The block hash is the double SHA-256 of the encoded header. Each header
//! carries the proposer's VRF output for its height, which seeds leader
//! selection for the next height.

use crate::codec::{get_var_size, BinaryWriter, MemoryReader, Serializable, SerializableExt};
use crate::{ConsensusError, ConsensusResult};
use vbft_config::ChainConfig;
use vbft_cryptography::vrf::{VrfOutput, VrfProof, VRF_OUTPUT_SIZE, VRF_PROOF_SIZE};
use vbft_cryptography::{hash256, sha512, Hash256};

/// Current block format version.
pub const BLOCK_VERSION: u32 = 0;

/// Maximum encoded size of a single transaction.
pub const MAX_TRANSACTION_SIZE: usize = 256 * 1024;

/// Hard wire limit on transactions per block.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 0xFFFF;

const GENESIS_DOMAIN: &[u8] = b"VBFT/genesis/v1";

/// Opaque transaction payload. Validation belongs to the transaction pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self(payload)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::of(&self.0)
    }
}

impl Serializable for Transaction {
    fn size(&self) -> usize {
        get_var_size(self.0.len() as u64) + self.0.len()
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        writer.write_var_bytes(&self.0);
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        Ok(Self(reader.read_var_bytes(MAX_TRANSACTION_SIZE)?))
    }
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub height: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub tx_root: Hash256,
    pub proposer: u32,
    pub vrf_value: VrfOutput,
    pub vrf_proof: VrfProof,
}

impl BlockHeader {
    /// Encoded header size.
    pub const SIZE: usize = 4 + 32 + 4 + 8 + 32 + 4 + VRF_OUTPUT_SIZE + VRF_PROOF_SIZE;

    pub fn hash(&self) -> Hash256 {
        Hash256(hash256(&self.to_array()))
    }
}

impl Serializable for BlockHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.version);
        writer.write_bytes(self.prev_hash.as_bytes());
        writer.write_u32(self.height);
        writer.write_u64(self.timestamp);
        writer.write_bytes(self.tx_root.as_bytes());
        writer.write_u32(self.proposer);
        writer.write_bytes(self.vrf_value.as_bytes());
        writer.write_bytes(self.vrf_proof.as_bytes());
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        Ok(Self {
            version: reader.read_u32()?,
            prev_hash: Hash256(reader.read_array()?),
            height: reader.read_u32()?,
            timestamp: reader.read_u64()?,
            tx_root: Hash256(reader.read_array()?),
            proposer: reader.read_u32()?,
            vrf_value: VrfOutput(reader.read_array()?),
            vrf_proof: VrfProof(reader.read_array()?),
        })
    }
}

/// A block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds the genesis block for a chain configuration. Every member of
    /// the committee derives the same block, including its VRF value.
    pub fn genesis(config: &ChainConfig) -> Self {
        let mut seed = Vec::with_capacity(GENESIS_DOMAIN.len() + 4 + config.peers.len() * 164);
        seed.extend_from_slice(GENESIS_DOMAIN);
        seed.extend_from_slice(&config.epoch.to_le_bytes());
        let mut peers: Vec<_> = config.peers.iter().collect();
        peers.sort_by_key(|p| p.index);
        for peer in peers {
            seed.extend_from_slice(&peer.index.to_le_bytes());
            seed.extend_from_slice(peer.id.as_str().as_bytes());
            seed.extend_from_slice(peer.vrf_key.as_str().as_bytes());
        }

        Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: Hash256::ZERO,
                height: 0,
                timestamp: 0,
                tx_root: Hash256::ZERO,
                proposer: 0,
                vrf_value: VrfOutput(sha512(&seed)),
                vrf_proof: VrfProof([0u8; VRF_PROOF_SIZE]),
            },
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Checks the parts of a block that need no chain context.
    pub fn validate_structure(&self, max_transactions: usize) -> ConsensusResult<()> {
        if self.header.version != BLOCK_VERSION {
            return Err(ConsensusError::invalid_proposal(format!(
                "unsupported block version {}",
                self.header.version
            )));
        }
        if self.transactions.len() > max_transactions {
            return Err(ConsensusError::invalid_proposal(format!(
                "{} transactions exceeds limit {}",
                self.transactions.len(),
                max_transactions
            )));
        }
        let root = compute_tx_root(&self.transactions);
        if root != self.header.tx_root {
            return Err(ConsensusError::invalid_proposal("transaction root mismatch"));
        }
        Ok(())
    }
}

impl Serializable for Block {
    fn size(&self) -> usize {
        BlockHeader::SIZE
            + get_var_size(self.transactions.len() as u64)
            + self.transactions.iter().map(Serializable::size).sum::<usize>()
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        self.header.serialize(writer);
        writer.write_var_int(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.serialize(writer);
        }
    }

    fn deserialize(reader: &mut MemoryReader) -> ConsensusResult<Self> {
        let header = BlockHeader::deserialize(reader)?;
        let count = reader.read_var_int(MAX_TRANSACTIONS_PER_BLOCK as u64)? as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::deserialize(reader)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Merkle root over transaction hashes. The last node of an odd level is
/// paired with itself; an empty list has the zero root.
pub fn compute_tx_root(transactions: &[Transaction]) -> Hash256 {
    let mut level: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.hash().0).collect();
    if level.is_empty() {
        return Hash256::ZERO;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(right);
                hash256(&buf)
            })
            .collect();
    }
    Hash256(level[0])
}

/// VRF input for `height`: the parent block's VRF output followed by the
/// height.
pub fn vrf_input(parent: &VrfOutput, height: u32) -> Vec<u8> {
    let mut input = Vec::with_capacity(64 + 4);
    input.extend_from_slice(parent.as_bytes());
    input.extend_from_slice(&height.to_le_bytes());
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbft_config::{NodeId, PeerConfig, VrfKey};
    use vbft_cryptography::{vrf, KeyPair};

    fn test_config() -> ChainConfig {
        let peers = (0..4u32)
            .map(|i| {
                let keypair = KeyPair::from_seed([i as u8 + 1; 32]);
                PeerConfig {
                    index: i,
                    id: NodeId::from_public_key(&keypair.public_key().to_bytes()),
                    vrf_key: VrfKey::from_bytes(&keypair.vrf_public_key().to_bytes()),
                }
            })
            .collect();
        ChainConfig::with_peers(peers)
    }

    fn sample_block() -> Block {
        let keypair = KeyPair::from_seed([1u8; 32]);
        let genesis = Block::genesis(&test_config());
        let (vrf_value, vrf_proof) = vrf::prove(&keypair, &vrf_input(&genesis.header.vrf_value, 1));
        let transactions = vec![Transaction::new(vec![1, 2, 3]), Transaction::new(vec![4])];
        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: genesis.hash(),
                height: 1,
                timestamp: 1_700_000_000_000,
                tx_root: compute_tx_root(&transactions),
                proposer: 0,
                vrf_value,
                vrf_proof,
            },
            transactions,
        }
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis(&test_config());
        let b = Block::genesis(&test_config());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.header.vrf_value, b.header.vrf_value);

        let mut other = test_config();
        other.epoch += 1;
        assert_ne!(Block::genesis(&other).header.vrf_value, a.header.vrf_value);
    }

    #[test]
    fn test_block_encoding_is_canonical() {
        let block = sample_block();
        let bytes = block.to_array();
        assert_eq!(bytes.len(), block.size());
        let decoded = Block::from_array(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_block_hash_is_double_sha_of_header() {
        let block = sample_block();
        assert_eq!(block.hash(), Hash256(hash256(&block.header.to_array())));
    }

    #[test]
    fn test_validate_structure() {
        let mut block = sample_block();
        assert!(block.validate_structure(10).is_ok());
        assert!(block.validate_structure(1).is_err());
        block.transactions.push(Transaction::new(vec![9]));
        assert!(matches!(
            block.validate_structure(10),
            Err(ConsensusError::InvalidProposal { .. })
        ));
    }

    #[test]
    fn test_tx_root() {
        assert_eq!(compute_tx_root(&[]), Hash256::ZERO);
        let tx = Transaction::new(vec![1]);
        assert_eq!(compute_tx_root(&[tx.clone()]), tx.hash());
        let three = vec![tx.clone(), Transaction::new(vec![2]), Transaction::new(vec![3])];
        assert_ne!(compute_tx_root(&three), compute_tx_root(&three[..2]));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_block().to_array();
        bytes.push(0);
        assert!(matches!(
            Block::from_array(&bytes),
            Err(ConsensusError::MalformedMessage { .. })
        ));
    }
}
