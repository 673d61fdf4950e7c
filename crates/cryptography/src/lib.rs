//! # VBFT Cryptography
//!
//! Cryptographic primitives used by the consensus core:
//!
//! - [`Hash256`] and the SHA-256 family of helpers, including
//!   domain-separated hashing so that message digests can never collide
//!   with block identity hashes.
//! - Ed25519 key pairs, public keys and fixed-size signatures.
//! - A BLS12-381 unique-signature verifiable random function used to
//!   derive per-height leader entropy.
//!
//! ## Example
//!
//! ```rust
//! use vbft_cryptography::{KeyPair, vrf};
//!
//! let keypair = KeyPair::from_seed([7u8; 32]);
//! let signature = keypair.sign(b"payload");
//! assert!(keypair.public_key().verify(b"payload", &signature));
//!
//! let (output, proof) = vrf::prove(&keypair, b"entropy");
//! assert_eq!(vrf::verify(&keypair.vrf_public_key(), b"entropy", &proof).unwrap(), output);
//! ```

pub mod ed25519;
pub mod error;
pub mod hash;
pub mod vrf;

pub use ed25519::{KeyPair, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use hash::{domain_hash, hash256, sha256, sha512, Hash256};
pub use vrf::{VrfOutput, VrfProof, VrfPublicKey, VRF_PROOF_SIZE, VRF_PUBLIC_KEY_SIZE};
