//! VBFT Configuration Module
//!
//! Committee membership and timing parameters shared by every member of a
//! consensus committee. A [`ChainConfig`] is normally loaded from a TOML file
//! and must be identical on all validators of the same epoch.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Target block interval in milliseconds.
pub const DEFAULT_BLOCK_MSEC: u64 = 5_000;

/// Base round timeout; round `r` waits `base << min(r, MAX_TIMEOUT_SHIFT)`.
pub const DEFAULT_ROUND_TIMEOUT_MSEC: u64 = 6_000;

/// Cap on the exponential backoff applied to round timeouts.
pub const MAX_TIMEOUT_SHIFT: u32 = 4;

/// Handshake timeout. A peer is considered dead after twice this long
/// without a handshake or heartbeat.
pub const DEFAULT_PEER_HANDSHAKE_TIMEOUT_MSEC: u64 = 10_000;

/// Interval between heartbeats broadcast by every member.
pub const DEFAULT_HEARTBEAT_INTERVAL_MSEC: u64 = 3_000;

/// Maximum transactions a leader packs into one proposal.
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 512;

/// How many rounds ahead of the current one messages are retained.
pub const DEFAULT_MAX_FUTURE_ROUNDS: u32 = 8;

/// Upper bound on a single ledger append before it is treated as failed.
pub const DEFAULT_LEDGER_APPEND_TIMEOUT_MSEC: u64 = 5_000;

/// Consecutive append failures tolerated before the node gives up.
pub const DEFAULT_MAX_APPEND_RETRIES: u32 = 10;

/// Size of an encoded validator public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an encoded VRF public key (compressed G1 point) in bytes.
pub const VRF_KEY_SIZE: usize = 48;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Node identifier is not valid hex or has the wrong length.
    #[error("Invalid node id {id}: {reason}")]
    InvalidNodeId {
        /// Offending identifier.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// VRF key is not valid hex or has the wrong length.
    #[error("Invalid VRF key {key}: {reason}")]
    InvalidVrfKey {
        /// Offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The committee has no members.
    #[error("Committee is empty")]
    EmptyCommittee,

    /// Two peers share a committee slot.
    #[error("Duplicate committee index: {0}")]
    DuplicateIndex(u32),

    /// Two peers share a node identifier.
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(NodeId),

    /// A parameter is out of range.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The TOML document could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// IO error while reading a config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    fn invalid_parameter<S: Into<String>>(name: &'static str, reason: S) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Hex-encoded validator public key identifying a committee member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Builds a node id from raw public key bytes.
    pub fn from_public_key(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Decodes the identifier into raw public key bytes.
    pub fn to_bytes(&self) -> ConfigResult<[u8; PUBLIC_KEY_SIZE]> {
        let raw = hex::decode(&self.0).map_err(|e| ConfigError::InvalidNodeId {
            id: self.0.clone(),
            reason: e.to_string(),
        })?;
        raw.as_slice()
            .try_into()
            .map_err(|_| ConfigError::InvalidNodeId {
                id: self.0.clone(),
                reason: format!("expected {} bytes, got {}", PUBLIC_KEY_SIZE, raw.len()),
            })
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.trim().to_lowercase());
        id.to_bytes()?;
        Ok(id)
    }
}

/// Hex-encoded VRF public key of a committee member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VrfKey(String);

impl VrfKey {
    /// Builds a key from its compressed encoding.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Decodes the key. Curve membership is checked by the consumer.
    pub fn to_bytes(&self) -> ConfigResult<[u8; VRF_KEY_SIZE]> {
        let raw = hex::decode(&self.0).map_err(|e| ConfigError::InvalidVrfKey {
            key: self.0.clone(),
            reason: e.to_string(),
        })?;
        raw.as_slice()
            .try_into()
            .map_err(|_| ConfigError::InvalidVrfKey {
                key: self.0.clone(),
                reason: format!("expected {} bytes, got {}", VRF_KEY_SIZE, raw.len()),
            })
    }

    /// Returns the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VrfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VrfKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = Self(s.trim().to_lowercase());
        key.to_bytes()?;
        Ok(key)
    }
}

/// One committee slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Stable committee index.
    pub index: u32,
    /// Public key of the member holding the slot.
    pub id: NodeId,
    /// Key that verifies the member's leader-election proofs.
    pub vrf_key: VrfKey,
}

/// Consensus parameters for one committee epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Committee epoch; bumped on every reconfiguration.
    pub epoch: u32,
    /// Committee members.
    pub peers: Vec<PeerConfig>,
    /// Target block interval.
    pub block_msec: u64,
    /// Base round timeout.
    pub round_timeout_msec: u64,
    /// Handshake timeout used for liveness decisions.
    pub peer_handshake_timeout_msec: u64,
    /// Heartbeat broadcast interval.
    pub heartbeat_interval_msec: u64,
    /// Maximum transactions per proposal.
    pub max_block_transactions: usize,
    /// Future-round retention window.
    pub max_future_rounds: u32,
    /// Bound on a single ledger append.
    pub ledger_append_timeout_msec: u64,
    /// Consecutive append failures tolerated.
    pub max_append_retries: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            epoch: 0,
            peers: Vec::new(),
            block_msec: DEFAULT_BLOCK_MSEC,
            round_timeout_msec: DEFAULT_ROUND_TIMEOUT_MSEC,
            peer_handshake_timeout_msec: DEFAULT_PEER_HANDSHAKE_TIMEOUT_MSEC,
            heartbeat_interval_msec: DEFAULT_HEARTBEAT_INTERVAL_MSEC,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
            max_future_rounds: DEFAULT_MAX_FUTURE_ROUNDS,
            ledger_append_timeout_msec: DEFAULT_LEDGER_APPEND_TIMEOUT_MSEC,
            max_append_retries: DEFAULT_MAX_APPEND_RETRIES,
        }
    }
}

impl ChainConfig {
    /// Creates a configuration for the given committee with default timings.
    pub fn with_peers(peers: Vec<PeerConfig>) -> Self {
        Self {
            peers,
            ..Default::default()
        }
    }

    /// Creates a configuration tuned for fast local runs and tests.
    pub fn for_testing(peers: Vec<PeerConfig>) -> Self {
        Self {
            peers,
            block_msec: 100,
            round_timeout_msec: 300,
            peer_handshake_timeout_msec: 1_000,
            heartbeat_interval_msec: 200,
            ledger_append_timeout_msec: 500,
            max_append_retries: 3,
            ..Default::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file without validating it. Missing fields
    /// take their defaults, so a file may carry timings only.
    pub fn read(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Checks committee well-formedness and parameter ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.peers.is_empty() {
            return Err(ConfigError::EmptyCommittee);
        }

        let mut indices = HashSet::new();
        let mut ids = HashSet::new();
        for peer in &self.peers {
            peer.id.to_bytes()?;
            peer.vrf_key.to_bytes()?;
            if !indices.insert(peer.index) {
                return Err(ConfigError::DuplicateIndex(peer.index));
            }
            if !ids.insert(&peer.id) {
                return Err(ConfigError::DuplicateNodeId(peer.id.clone()));
            }
        }

        for (name, value) in [
            ("block_msec", self.block_msec),
            ("round_timeout_msec", self.round_timeout_msec),
            ("peer_handshake_timeout_msec", self.peer_handshake_timeout_msec),
            ("heartbeat_interval_msec", self.heartbeat_interval_msec),
            ("ledger_append_timeout_msec", self.ledger_append_timeout_msec),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_parameter(name, "must be greater than 0"));
            }
        }

        if self.max_block_transactions == 0 {
            return Err(ConfigError::invalid_parameter(
                "max_block_transactions",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Number of committee members.
    pub fn committee_size(&self) -> usize {
        self.peers.len()
    }

    /// Number of faulty members tolerated: f = (n-1)/3.
    pub fn max_faulty(&self) -> usize {
        self.committee_size().saturating_sub(1) / 3
    }

    /// Matching votes required to decide: n - f (2f+1 when n = 3f+1).
    pub fn quorum(&self) -> usize {
        self.committee_size() - self.max_faulty()
    }

    /// Finds the slot held by `id`.
    pub fn index_of(&self, id: &NodeId) -> Option<u32> {
        self.peers.iter().find(|p| &p.id == id).map(|p| p.index)
    }

    /// Timeout for `round`, doubling per round up to the cap.
    pub fn round_timeout(&self, round: u32) -> u64 {
        self.round_timeout_msec << round.min(MAX_TIMEOUT_SHIFT)
    }
}
