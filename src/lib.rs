//! # VBFT: VRF-based Byzantine fault tolerant consensus
//!
//! Facade over the workspace crates:
//!
//! - [`config`] - committee and timing configuration
//! - [`crypto`] - Ed25519 keys, hashing and the BLS12-381 VRF
//! - [`consensus`] - peer pool, wire codec and the consensus state machine
//!
//! ## Quick Start
//!
//! ```rust
//! use vbft::prelude::*;
//!
//! let keys: Vec<KeyPair> = (1..=4u8).map(|i| KeyPair::from_seed([i; 32])).collect();
//! let peers = keys
//!     .iter()
//!     .enumerate()
//!     .map(|(i, k)| PeerConfig {
//!         index: i as u32,
//!         id: NodeId::from_public_key(&k.public_key().to_bytes()),
//!         vrf_key: VrfKey::from_bytes(&k.vrf_public_key().to_bytes()),
//!     })
//!     .collect();
//! let config = ChainConfig::with_peers(peers);
//! assert_eq!(config.quorum(), 3);
//!
//! let genesis = Block::genesis(&config);
//! let leader = select_leader(&[0, 1, 2, 3], &genesis.header.vrf_value, 0);
//! assert!(leader.is_some());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use vbft_config as config;
pub use vbft_consensus as consensus;
pub use vbft_cryptography as crypto;

/// Common imports for embedding a validator
pub mod prelude {
    pub use crate::config::{ChainConfig, NodeId, PeerConfig, VrfKey};
    pub use crate::consensus::{
        select_leader, Block, ConsensusCommand, ConsensusError, ConsensusEvent, ConsensusHandle,
        ConsensusRunner, ConsensusService, ConsensusStatus, Ledger, LocalNetwork, Network,
        PeerPool, TxPool,
    };
    pub use crate::crypto::{Hash256, KeyPair, PublicKey, Signature, VrfPublicKey};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
