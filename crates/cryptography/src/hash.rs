//! Hash functions for VBFT.
//!
//! Block identities use double SHA-256 ([`hash256`]); consensus message
//! digests use [`domain_hash`] so the two can never be confused.

use crate::{CryptoError, CryptoResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Computes SHA-256 hash of the input data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes SHA-512 hash of the input data.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes Hash256 (double SHA-256) of the input data.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let first_hash = sha256(data);
    sha256(&first_hash)
}

/// SHA-256 over `domain || data`.
pub fn domain_hash(domain: &[u8], data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    Hash256(hasher.finalize().into())
}

/// A 32-byte digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Length in bytes.
    pub const LEN: usize = 32;

    /// Double SHA-256 of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(hash256(data))
    }

    /// Builds a hash from a slice, failing on wrong length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns true for the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps tracing output readable
        write!(f, "Hash256({})", &hex::encode(self.0)[..16])
    }
}

impl FromStr for Hash256 {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&raw)
    }
}
