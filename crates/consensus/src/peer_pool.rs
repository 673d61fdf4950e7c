//! Committee peer pool.
//!
//! Tracks the known validator set, per-peer connection state, the latest
//! handshake and heartbeat, and liveness. Every access goes through one
//! read/write lock and no method blocks on I/O.
//!
//! Stored [`Peer`] records are immutable: each transition builds a fresh
//! value and swaps it into the map, so callers holding an `Arc<Peer>` own a
//! consistent snapshot that later updates never touch.

use crate::current_timestamp;
use crate::messages::PeerStatus;
use crate::{ConsensusError, ConsensusResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use vbft_config::{ChainConfig, NodeId, PeerConfig};
use vbft_cryptography::{PublicKey, VrfPublicKey};

/// How a new connection relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Same session re-established; prior handshake and heartbeat are kept.
    Resume,
    /// Transport reported a new session; prior peer history is cleared.
    Fresh,
}

/// One committee member as known to this node.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Committee slot.
    pub index: u32,
    /// Key used to verify the member's messages.
    pub public_key: PublicKey,
    /// Key used to verify the member's VRF proofs.
    pub vrf_key: VrfPublicKey,
    /// Last handshake received.
    pub last_handshake: Option<PeerStatus>,
    /// Last heartbeat received.
    pub last_heartbeat: Option<PeerStatus>,
    /// Milliseconds since the Unix epoch; zero until the first update.
    pub last_update_time: u64,
    pub connected: bool,
}

#[derive(Debug, Default)]
struct PoolInner {
    handshake_timeout_ms: u64,
    configs: HashMap<u32, PeerConfig>,
    id_map: HashMap<NodeId, u32>,
    peers: HashMap<u32, Arc<Peer>>,
}

impl PoolInner {
    fn replace<F>(&mut self, index: u32, update: F) -> ConsensusResult<()>
    where
        F: FnOnce(&Peer) -> Peer,
    {
        let current = self
            .peers
            .get(&index)
            .ok_or(ConsensusError::UnknownPeer(index))?;
        let next = update(current);
        self.peers.insert(index, Arc::new(next));
        Ok(())
    }
}

/// Concurrency-safe committee bookkeeping.
#[derive(Debug)]
pub struct PeerPool {
    inner: RwLock<PoolInner>,
}

impl PeerPool {
    /// Creates an empty pool. Peers are considered dead once silent for
    /// twice `handshake_timeout_ms`.
    pub fn new(handshake_timeout_ms: u64) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                handshake_timeout_ms,
                ..Default::default()
            }),
        }
    }

    /// Creates a pool holding every member of `config`.
    pub fn from_config(config: &ChainConfig) -> ConsensusResult<Self> {
        let pool = Self::new(config.peer_handshake_timeout_msec);
        for peer in &config.peers {
            pool.add_peer(peer)?;
        }
        Ok(pool)
    }

    /// Registers a committee slot, decoding its keys from the config.
    pub fn add_peer(&self, config: &PeerConfig) -> ConsensusResult<()> {
        let (public_key, vrf_key) = decode_keys(config)?;
        let mut inner = self.inner.write();
        inner.configs.insert(config.index, config.clone());
        inner.id_map.insert(config.id.clone(), config.index);
        inner.peers.insert(
            config.index,
            Arc::new(Peer {
                index: config.index,
                public_key,
                vrf_key,
                last_handshake: None,
                last_heartbeat: None,
                last_update_time: 0,
                connected: false,
            }),
        );
        debug!(index = config.index, id = %config.id, "Peer added");
        Ok(())
    }

    /// True when the peer is unknown or not connected.
    pub fn is_new_peer(&self, index: u32) -> bool {
        self.inner
            .read()
            .peers
            .get(&index)
            .map_or(true, |peer| !peer.connected)
    }

    pub fn peer_connected(&self, index: u32, mode: SessionMode) -> ConsensusResult<()> {
        self.inner.write().replace(index, |peer| match mode {
            SessionMode::Resume => Peer {
                connected: true,
                ..peer.clone()
            },
            SessionMode::Fresh => Peer {
                index: peer.index,
                public_key: peer.public_key,
                vrf_key: peer.vrf_key,
                last_handshake: None,
                last_heartbeat: None,
                last_update_time: 0,
                connected: true,
            },
        })?;
        info!(index, ?mode, "Peer connected");
        Ok(())
    }

    /// Marks the peer disconnected, keeping `last_update_time` for
    /// diagnostics.
    pub fn peer_disconnected(&self, index: u32) -> ConsensusResult<()> {
        self.inner.write().replace(index, |peer| Peer {
            connected: false,
            ..peer.clone()
        })?;
        info!(index, "Peer disconnected");
        Ok(())
    }

    pub fn peer_handshake(&self, index: u32, status: PeerStatus) -> ConsensusResult<()> {
        let now = current_timestamp();
        self.inner.write().replace(index, |peer| Peer {
            last_handshake: Some(status),
            last_update_time: now,
            connected: true,
            ..peer.clone()
        })
    }

    pub fn peer_heartbeat(&self, index: u32, status: PeerStatus) -> ConsensusResult<()> {
        let now = current_timestamp();
        self.inner.write().replace(index, |peer| Peer {
            last_heartbeat: Some(status),
            last_update_time: now,
            connected: true,
            ..peer.clone()
        })
    }

    pub fn is_peer_alive(&self, index: u32) -> bool {
        self.is_peer_alive_at(index, current_timestamp())
    }

    /// Liveness as of `now` (milliseconds since the Unix epoch).
    pub fn is_peer_alive_at(&self, index: u32, now: u64) -> bool {
        let inner = self.inner.read();
        let Some(peer) = inner.peers.get(&index) else {
            return false;
        };
        if !peer.connected {
            return false;
        }
        now.saturating_sub(peer.last_update_time) <= inner.handshake_timeout_ms.saturating_mul(2)
    }

    /// Snapshot of all connected peers, ordered by index.
    pub fn get_neighbours(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read();
        let mut peers: Vec<_> = inner
            .peers
            .values()
            .filter(|peer| peer.connected)
            .cloned()
            .collect();
        peers.sort_by_key(|peer| peer.index);
        peers
    }

    pub fn get_peer_index(&self, id: &NodeId) -> Option<u32> {
        self.inner.read().id_map.get(id).copied()
    }

    pub fn get_peer_pub_key(&self, index: u32) -> Option<PublicKey> {
        self.inner.read().peers.get(&index).map(|peer| peer.public_key)
    }

    pub fn get_peer_vrf_key(&self, index: u32) -> Option<VrfPublicKey> {
        self.inner.read().peers.get(&index).map(|peer| peer.vrf_key)
    }

    pub fn get_peer(&self, index: u32) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(&index).cloned()
    }

    pub fn get_active_peer_count(&self) -> usize {
        self.inner
            .read()
            .peers
            .values()
            .filter(|peer| peer.connected)
            .count()
    }

    /// Sorted committee indices.
    pub fn committee(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.inner.read().configs.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn len(&self) -> usize {
        self.inner.read().configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every peer, config and id mapping.
    pub fn clean(&self) {
        let mut inner = self.inner.write();
        inner.configs.clear();
        inner.id_map.clear();
        inner.peers.clear();
    }

    /// Replaces the committee with the members of `config`. All new keys are
    /// decoded before the pool is touched, so a bad config leaves it intact.
    pub fn reset(&self, config: &ChainConfig) -> ConsensusResult<()> {
        let mut peers = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            peers.push((peer.clone(), decode_keys(peer)?));
        }

        self.clean();
        let mut inner = self.inner.write();
        inner.handshake_timeout_ms = config.peer_handshake_timeout_msec;
        for (peer, (public_key, vrf_key)) in peers {
            inner.id_map.insert(peer.id.clone(), peer.index);
            inner.peers.insert(
                peer.index,
                Arc::new(Peer {
                    index: peer.index,
                    public_key,
                    vrf_key,
                    last_handshake: None,
                    last_heartbeat: None,
                    last_update_time: 0,
                    connected: false,
                }),
            );
            inner.configs.insert(peer.index, peer);
        }
        info!(epoch = config.epoch, members = config.peers.len(), "Peer pool reset");
        Ok(())
    }
}

fn decode_keys(config: &PeerConfig) -> ConsensusResult<(PublicKey, VrfPublicKey)> {
    let invalid = |e: &dyn std::fmt::Display| ConsensusError::InvalidPeerKey {
        index: config.index,
        message: e.to_string(),
    };
    let public_key = config
        .id
        .to_bytes()
        .map_err(|e| invalid(&e))
        .and_then(|bytes| PublicKey::from_bytes(&bytes).map_err(|e| invalid(&e)))?;
    let vrf_key = config
        .vrf_key
        .to_bytes()
        .map_err(|e| invalid(&e))
        .and_then(|bytes| VrfPublicKey::from_bytes(&bytes).map_err(|e| invalid(&e)))?;
    Ok((public_key, vrf_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbft_config::VrfKey;
    use vbft_cryptography::{Hash256, KeyPair};

    fn peer_config(index: u32) -> (PeerConfig, KeyPair) {
        let keypair = KeyPair::from_seed([index as u8 + 1; 32]);
        let config = PeerConfig {
            index,
            id: NodeId::from_public_key(&keypair.public_key().to_bytes()),
            vrf_key: VrfKey::from_bytes(&keypair.vrf_public_key().to_bytes()),
        };
        (config, keypair)
    }

    fn status(height: u32) -> PeerStatus {
        PeerStatus {
            epoch: 0,
            committed_height: height,
            committed_hash: Hash256::ZERO,
            timestamp: 0,
        }
    }

    #[test]
    fn test_add_peer_starts_disconnected() {
        let pool = PeerPool::new(1_000);
        let (config, keypair) = peer_config(0);
        pool.add_peer(&config).unwrap();

        let peer = pool.get_peer(0).unwrap();
        assert_eq!(peer.public_key, keypair.public_key());
        assert_eq!(pool.get_peer_vrf_key(0), Some(keypair.vrf_public_key()));
        assert!(!peer.connected);
        assert_eq!(peer.last_update_time, 0);
        assert!(pool.is_new_peer(0));
        assert_eq!(pool.get_peer_index(&config.id), Some(0));
    }

    #[test]
    fn test_add_peer_rejects_bad_id() {
        let pool = PeerPool::new(1_000);
        let mut config = PeerConfig {
            index: 3,
            id: NodeId::from_public_key(&[1, 2, 3]),
            vrf_key: peer_config(3).0.vrf_key,
        };
        assert!(matches!(
            pool.add_peer(&config),
            Err(ConsensusError::InvalidPeerKey { index: 3, .. })
        ));

        // Right length, but not a point on the curve
        config.id = peer_config(3).0.id;
        config.vrf_key = VrfKey::from_bytes(&[0xff; 48]);
        assert!(matches!(
            pool.add_peer(&config),
            Err(ConsensusError::InvalidPeerKey { index: 3, .. })
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_snapshots_are_not_mutated() {
        let pool = PeerPool::new(1_000);
        pool.add_peer(&peer_config(0).0).unwrap();
        let before = pool.get_peer(0).unwrap();
        pool.peer_heartbeat(0, status(4)).unwrap();
        assert!(before.last_heartbeat.is_none());
        assert_eq!(pool.get_peer(0).unwrap().last_heartbeat, Some(status(4)));
    }

    #[test]
    fn test_session_modes() {
        let pool = PeerPool::new(1_000);
        pool.add_peer(&peer_config(1).0).unwrap();
        pool.peer_handshake(1, status(1)).unwrap();
        pool.peer_heartbeat(1, status(2)).unwrap();

        pool.peer_disconnected(1).unwrap();
        pool.peer_connected(1, SessionMode::Resume).unwrap();
        let peer = pool.get_peer(1).unwrap();
        assert_eq!(peer.last_handshake, Some(status(1)));
        assert_eq!(peer.last_heartbeat, Some(status(2)));
        assert!(peer.last_update_time > 0);

        pool.peer_connected(1, SessionMode::Fresh).unwrap();
        let peer = pool.get_peer(1).unwrap();
        assert!(peer.connected);
        assert!(peer.last_handshake.is_none());
        assert!(peer.last_heartbeat.is_none());
    }

    #[test]
    fn test_unknown_index() {
        let pool = PeerPool::new(1_000);
        assert!(matches!(
            pool.peer_connected(9, SessionMode::Fresh),
            Err(ConsensusError::UnknownPeer(9))
        ));
        assert!(pool.peer_disconnected(9).is_err());
        assert!(!pool.is_peer_alive(9));
        assert!(pool.is_new_peer(9));
        assert!(pool.get_peer(9).is_none());
    }

    #[test]
    fn test_reset_keeps_pool_on_bad_config() {
        let pool = PeerPool::new(1_000);
        pool.add_peer(&peer_config(0).0).unwrap();
        let mut config = ChainConfig::with_peers(vec![peer_config(5).0]);
        config.peers.push(PeerConfig {
            index: 6,
            id: NodeId::from_public_key(&[0u8; 3]),
            vrf_key: peer_config(6).0.vrf_key,
        });
        assert!(pool.reset(&config).is_err());
        assert_eq!(pool.committee(), vec![0]);

        config.peers.pop();
        pool.reset(&config).unwrap();
        assert_eq!(pool.committee(), vec![5]);
    }
}
