//! Consensus messages and their wire encoding.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! [type:1][height:4][round:4][sender:4][payload:var][signature:64]
//! ```
//!
//! The signature covers every byte before it. Decoding is strict: unknown
//! type tags, short input and trailing bytes are all rejected as
//! [`ConsensusError::MalformedMessage`].

mod proposal;
mod status;
mod vote;

pub use proposal::{hash_proposal, BlockProposal};
pub use status::PeerStatus;
pub use vote::Vote;

use crate::codec::{BinaryWriter, MemoryReader, Serializable};
use crate::peer_pool::PeerPool;
use crate::{ConsensusError, ConsensusMessageType, ConsensusResult};
use vbft_cryptography::{domain_hash, Hash256, KeyPair, PublicKey, Signature, SIGNATURE_SIZE};

const MESSAGE_DOMAIN: &[u8] = b"VBFT/message/v1";

/// Size of the fixed message header: type, height, round, sender.
pub const HEADER_SIZE: usize = 1 + 4 + 4 + 4;

/// Message body, one variant per wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusPayload {
    Handshake(PeerStatus),
    Heartbeat(PeerStatus),
    Proposal(BlockProposal),
    Endorse(Vote),
    Commit(Vote),
}

impl ConsensusPayload {
    pub fn message_type(&self) -> ConsensusMessageType {
        match self {
            Self::Handshake(_) => ConsensusMessageType::Handshake,
            Self::Heartbeat(_) => ConsensusMessageType::Heartbeat,
            Self::Proposal(_) => ConsensusMessageType::Proposal,
            Self::Endorse(_) => ConsensusMessageType::Endorse,
            Self::Commit(_) => ConsensusMessageType::Commit,
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Handshake(s) | Self::Heartbeat(s) => s.size(),
            Self::Proposal(p) => p.size(),
            Self::Endorse(v) | Self::Commit(v) => v.size(),
        }
    }

    fn serialize(&self, writer: &mut BinaryWriter) {
        match self {
            Self::Handshake(s) | Self::Heartbeat(s) => s.serialize(writer),
            Self::Proposal(p) => p.serialize(writer),
            Self::Endorse(v) | Self::Commit(v) => v.serialize(writer),
        }
    }

    fn deserialize(
        message_type: ConsensusMessageType,
        reader: &mut MemoryReader,
    ) -> ConsensusResult<Self> {
        Ok(match message_type {
            ConsensusMessageType::Handshake => Self::Handshake(PeerStatus::deserialize(reader)?),
            ConsensusMessageType::Heartbeat => Self::Heartbeat(PeerStatus::deserialize(reader)?),
            ConsensusMessageType::Proposal => Self::Proposal(BlockProposal::deserialize(reader)?),
            ConsensusMessageType::Endorse => Self::Endorse(Vote::deserialize(reader)?),
            ConsensusMessageType::Commit => Self::Commit(Vote::deserialize(reader)?),
        })
    }
}

/// An unsigned consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMessage {
    pub height: u32,
    pub round: u32,
    pub sender: u32,
    pub payload: ConsensusPayload,
}

impl ConsensusMessage {
    pub fn new(height: u32, round: u32, sender: u32, payload: ConsensusPayload) -> Self {
        Self {
            height,
            round,
            sender,
            payload,
        }
    }

    pub fn message_type(&self) -> ConsensusMessageType {
        self.payload.message_type()
    }

    /// Canonical bytes covered by the signature.
    pub fn sign_data(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::with_capacity(HEADER_SIZE + self.payload.size());
        writer.write_u8(self.message_type().to_byte());
        writer.write_u32(self.height);
        writer.write_u32(self.round);
        writer.write_u32(self.sender);
        self.payload.serialize(&mut writer);
        writer.into_bytes()
    }

    /// Signs the message with the sender's key.
    pub fn sign(self, keypair: &KeyPair) -> SignedMessage {
        let signature = sign_message(&self, keypair);
        SignedMessage {
            message: self,
            signature,
        }
    }
}

/// Signs the canonical encoding of `message`.
pub fn sign_message(message: &ConsensusMessage, keypair: &KeyPair) -> Signature {
    keypair.sign(&message.sign_data())
}

/// Checks `signature` over the canonical encoding of `message`.
pub fn verify_message(
    message: &ConsensusMessage,
    signature: &Signature,
    public_key: &PublicKey,
) -> bool {
    public_key.verify(&message.sign_data(), signature)
}

/// A message together with its signature, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub message: ConsensusMessage,
    pub signature: Signature,
}

impl SignedMessage {
    /// Full wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.message.sign_data();
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }

    /// Strictly decodes wire bytes. Does not check the signature.
    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut reader = MemoryReader::new(bytes);
        let tag = reader.read_u8()?;
        let message_type = ConsensusMessageType::from_byte(tag).ok_or_else(|| {
            ConsensusError::malformed(format!("unknown message type {:#04x}", tag))
        })?;
        let height = reader.read_u32()?;
        let round = reader.read_u32()?;
        let sender = reader.read_u32()?;
        let payload = ConsensusPayload::deserialize(message_type, &mut reader)?;
        let signature = Signature(reader.read_array::<SIGNATURE_SIZE>()?);
        reader.ensure_consumed()?;

        Ok(Self {
            message: ConsensusMessage::new(height, round, sender, payload),
            signature,
        })
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        verify_message(&self.message, &self.signature, public_key)
    }

    /// Digest of the signed bytes, used for duplicate suppression.
    pub fn digest(&self) -> Hash256 {
        domain_hash(MESSAGE_DOMAIN, &self.encode())
    }
}

/// A message whose signature has been checked against the sender's
/// committee key. Only the admission path can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMessage {
    signed: SignedMessage,
    digest: Hash256,
}

impl VerifiedMessage {
    pub(crate) fn new(signed: SignedMessage) -> Self {
        let digest = signed.digest();
        Self { signed, digest }
    }

    pub fn message(&self) -> &ConsensusMessage {
        &self.signed.message
    }

    pub fn signed(&self) -> &SignedMessage {
        &self.signed
    }

    pub fn digest(&self) -> Hash256 {
        self.digest
    }

    pub fn height(&self) -> u32 {
        self.signed.message.height
    }

    pub fn round(&self) -> u32 {
        self.signed.message.round
    }

    pub fn sender(&self) -> u32 {
        self.signed.message.sender
    }

    pub fn message_type(&self) -> ConsensusMessageType {
        self.signed.message.message_type()
    }
}

/// Verifies a decoded message against the committee.
pub fn verify_signed(signed: SignedMessage, pool: &PeerPool) -> ConsensusResult<VerifiedMessage> {
    let sender = signed.message.sender;
    let public_key = pool
        .get_peer_pub_key(sender)
        .ok_or(ConsensusError::UnknownPeer(sender))?;

    if !signed.verify(&public_key) {
        return Err(ConsensusError::BadSignature { sender });
    }

    if let ConsensusPayload::Proposal(proposal) = &signed.message.payload {
        // A re-proposed block keeps its original proposer
        if proposal.valid_round.is_none() && proposal.proposer() != sender {
            return Err(ConsensusError::malformed(format!(
                "proposal header names proposer {} but was sent by {}",
                proposal.proposer(),
                sender
            )));
        }
        if proposal.block.height() != signed.message.height {
            return Err(ConsensusError::malformed(format!(
                "proposal block height {} does not match message height {}",
                proposal.block.height(),
                signed.message.height
            )));
        }
    }

    Ok(VerifiedMessage::new(signed))
}

/// Decodes wire bytes and verifies them against the committee.
pub fn decode_verified(bytes: &[u8], pool: &PeerPool) -> ConsensusResult<VerifiedMessage> {
    verify_signed(SignedMessage::decode(bytes)?, pool)
}
