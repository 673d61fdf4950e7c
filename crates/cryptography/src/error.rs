//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur while handling keys, signatures and VRF proofs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key bytes do not describe a valid key.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature bytes are malformed.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A VRF proof did not verify against the claimed key and input.
    #[error("VRF proof verification failed")]
    InvalidVrfProof,

    /// Hex decoding failed.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
