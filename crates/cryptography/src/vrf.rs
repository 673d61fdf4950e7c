//! Verifiable random function built on BLS12-381 unique signatures.
//!
//! The proof is `sk * H(input)` in G2, with `H` the hash-to-curve map, and
//! the output is SHA-512 of the compressed proof. Verification is the
//! pairing check `e(pk, H(input)) == e(g1, proof)`. Only the point
//! `sk * H(input)` satisfies it, so a key and input admit exactly one valid
//! proof and one output. The VRF secret is derived from the validator's
//! Ed25519 seed, so a node keeps a single secret on disk.

use crate::{sha512, CryptoError, CryptoResult, KeyPair};
use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G2Affine, G2Projective, Scalar};
use std::fmt;
use zeroize::Zeroizing;

const VRF_DST: &[u8] = b"VBFT-VRF-V1_BLS12381G2_XMD:SHA-256_SSWU_RO_";
const VRF_KEY_DOMAIN: &[u8] = b"VBFT/vrf-key/v1";

/// VRF output size in bytes.
pub const VRF_OUTPUT_SIZE: usize = 64;

/// Encoded proof size (compressed G2 point).
pub const VRF_PROOF_SIZE: usize = 96;

/// Encoded VRF public key size (compressed G1 point).
pub const VRF_PUBLIC_KEY_SIZE: usize = 48;

/// Pseudo-random output of the VRF.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VrfOutput(pub [u8; VRF_OUTPUT_SIZE]);

impl VrfOutput {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; VRF_OUTPUT_SIZE] {
        &self.0
    }

    /// First 32 bytes, used as an RNG seed.
    pub fn seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&self.0[..32]);
        seed
    }
}

impl Default for VrfOutput {
    fn default() -> Self {
        Self([0u8; VRF_OUTPUT_SIZE])
    }
}

impl fmt::Debug for VrfOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfOutput({}..)", &hex::encode(self.0)[..16])
    }
}

/// Proof that a [`VrfOutput`] was produced by a given key.
///
/// Kept in encoded form; it is decoded and checked by [`verify`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VrfProof(pub [u8; VRF_PROOF_SIZE]);

impl VrfProof {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; VRF_PROOF_SIZE] {
        &self.0
    }
}

impl fmt::Debug for VrfProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfProof({}..)", &hex::encode(self.0)[..16])
    }
}

/// Public key that checks VRF proofs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VrfPublicKey(G1Affine);

impl VrfPublicKey {
    /// Parses a compressed G1 point. The identity is rejected.
    pub fn from_bytes(bytes: &[u8; VRF_PUBLIC_KEY_SIZE]) -> CryptoResult<Self> {
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(bytes))
            .ok_or_else(|| CryptoError::InvalidKey("VRF key is not a G1 point".into()))?;
        if bool::from(point.is_identity()) {
            return Err(CryptoError::InvalidKey("VRF key is the identity".into()));
        }
        Ok(Self(point))
    }

    /// Parses a key from an arbitrary slice.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; VRF_PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                VRF_PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Self::from_bytes(&array)
    }

    /// Compressed key bytes.
    pub fn to_bytes(&self) -> [u8; VRF_PUBLIC_KEY_SIZE] {
        self.0.to_compressed()
    }
}

impl fmt::Debug for VrfPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfPublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for VrfPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

fn secret_scalar(keypair: &KeyPair) -> Scalar {
    let seed = keypair.seed();
    let mut material = Zeroizing::new(Vec::with_capacity(VRF_KEY_DOMAIN.len() + seed.len()));
    material.extend_from_slice(VRF_KEY_DOMAIN);
    material.extend_from_slice(&seed[..]);
    let wide = Zeroizing::new(sha512(&material));
    Scalar::from_bytes_wide(&wide)
}

fn hash_to_g2(input: &[u8]) -> G2Projective {
    <G2Projective as HashToCurve<ExpandMsgXmd<sha2::Sha256>>>::hash_to_curve(input, VRF_DST)
}

fn output_of(point: &G2Affine) -> VrfOutput {
    VrfOutput(sha512(&point.to_compressed()))
}

pub(crate) fn public_key(keypair: &KeyPair) -> VrfPublicKey {
    VrfPublicKey(G1Affine::from(G1Affine::generator() * secret_scalar(keypair)))
}

/// Evaluates the VRF on `input`.
pub fn prove(keypair: &KeyPair, input: &[u8]) -> (VrfOutput, VrfProof) {
    let sigma = G2Affine::from(hash_to_g2(input) * secret_scalar(keypair));
    (output_of(&sigma), VrfProof(sigma.to_compressed()))
}

/// Checks `proof` and returns the output it commits to.
pub fn verify(
    public_key: &VrfPublicKey,
    input: &[u8],
    proof: &VrfProof,
) -> CryptoResult<VrfOutput> {
    let sigma = Option::<G2Affine>::from(G2Affine::from_compressed(&proof.0))
        .ok_or(CryptoError::InvalidVrfProof)?;
    let hashed = G2Affine::from(hash_to_g2(input));
    if pairing(&public_key.0, &hashed) != pairing(&G1Affine::generator(), &sigma) {
        return Err(CryptoError::InvalidVrfProof);
    }
    Ok(output_of(&sigma))
}
