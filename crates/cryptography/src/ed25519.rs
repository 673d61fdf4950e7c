//! Ed25519 implementation for VBFT.
//!
//! Validators sign every consensus message with Ed25519. Public keys are
//! distributed through the committee configuration as hex node ids.

use crate::vrf::{self, VrfPublicKey};
use crate::{CryptoError, CryptoResult};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use zeroize::Zeroizing;

/// Encoded public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Encoded signature size.
pub const SIGNATURE_SIZE: usize = 64;

/// A validator signing key.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, seed.as_mut());
        Self::from_seed(*seed)
    }

    /// Deterministically derives a key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Parses a hex-encoded 32-byte seed.
    pub fn from_hex(secret: &str) -> CryptoResult<Self> {
        let raw = Zeroizing::new(
            hex::decode(secret.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?,
        );
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected 32 byte seed, got {}", raw.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Key that verifies this validator's VRF proofs.
    pub fn vrf_public_key(&self) -> VrfPublicKey {
        vrf::public_key(self)
    }

    pub(crate) fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Signs `message`. Ed25519 signing is deterministic.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A validator verification key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parses a compressed Edwards point.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> CryptoResult<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Parses a key from an arbitrary slice.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Self::from_bytes(&array)
    }

    /// Encoded key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// A fixed-size Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Builds a signature from a slice, failing on wrong length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        bytes.try_into().map(Self).map_err(|_| {
            CryptoError::InvalidSignature(format!(
                "expected {} bytes, got {}",
                SIGNATURE_SIZE,
                bytes.len()
            ))
        })
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &hex::encode(self.0)[..16])
    }
}
