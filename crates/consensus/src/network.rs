//! Peer network adapter.
//!
//! [`Network`] is what the runner needs from the transport. [`LocalNetwork`]
//! is an in-process hub that delivers wire bytes straight to every
//! registered [`ConsensusHandle`], with per-member isolation for testing
//! partitions.

use crate::peer_pool::SessionMode;
use crate::runner::ConsensusHandle;
use crate::{ConsensusError, ConsensusResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Outbound side of the peer network
#[async_trait]
pub trait Network: Send + Sync {
    /// Sends encoded bytes to every other committee member
    async fn broadcast(&self, bytes: Vec<u8>) -> ConsensusResult<()>;

    /// Sends encoded bytes to one member
    async fn send_to(&self, index: u32, bytes: Vec<u8>) -> ConsensusResult<()>;
}

#[derive(Debug, Default)]
struct HubInner {
    handles: BTreeMap<u32, ConsensusHandle>,
    isolated: HashSet<u32>,
}

/// In-process message hub
#[derive(Debug, Default)]
pub struct LocalNetwork {
    inner: RwLock<HubInner>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a validator's handle as a delivery target
    pub fn register(&self, handle: ConsensusHandle) -> ConsensusResult<()> {
        let index = handle.index().ok_or(ConsensusError::NotValidator)?;
        self.inner.write().handles.insert(index, handle);
        Ok(())
    }

    /// Outbound endpoint for the member at `index`
    pub fn endpoint(self: &Arc<Self>, index: u32) -> Arc<dyn Network> {
        Arc::new(LocalEndpoint {
            hub: self.clone(),
            index,
        })
    }

    /// Reports a fresh connection between every pair of registered members
    pub fn connect_all(&self) -> ConsensusResult<()> {
        let handles = self.handles();
        for (index, handle) in &handles {
            for other in handles.keys().filter(|other| *other != index) {
                handle.peer_connected(*other, SessionMode::Fresh)?;
            }
        }
        Ok(())
    }

    /// Cuts `index` off from everyone in both directions
    pub fn isolate(&self, index: u32) -> ConsensusResult<()> {
        self.inner.write().isolated.insert(index);
        let handles = self.handles();
        for (other, handle) in &handles {
            if *other == index {
                for peer in handles.keys().filter(|peer| **peer != index) {
                    handle.peer_disconnected(*peer)?;
                }
            } else {
                handle.peer_disconnected(index)?;
            }
        }
        info!(validator = index, "Validator isolated");
        Ok(())
    }

    /// Reconnects an isolated member, resuming existing sessions
    pub fn heal(&self, index: u32) -> ConsensusResult<()> {
        if !self.inner.write().isolated.remove(&index) {
            return Ok(());
        }
        let handles = self.handles();
        for (other, handle) in &handles {
            if *other == index {
                for peer in handles.keys().filter(|peer| **peer != index) {
                    handle.peer_connected(*peer, SessionMode::Resume)?;
                }
            } else {
                handle.peer_connected(index, SessionMode::Resume)?;
            }
        }
        info!(validator = index, "Validator reconnected");
        Ok(())
    }

    pub fn is_isolated(&self, index: u32) -> bool {
        self.inner.read().isolated.contains(&index)
    }

    fn handles(&self) -> BTreeMap<u32, ConsensusHandle> {
        self.inner.read().handles.clone()
    }

    /// Targets reachable from `from`, never including `from` itself
    fn targets(&self, from: u32, to: Option<u32>) -> Vec<(u32, ConsensusHandle)> {
        let inner = self.inner.read();
        if inner.isolated.contains(&from) {
            return Vec::new();
        }
        inner
            .handles
            .iter()
            .filter(|(index, _)| **index != from && !inner.isolated.contains(*index))
            .filter(|(index, _)| to.map_or(true, |to| **index == to))
            .map(|(index, handle)| (*index, handle.clone()))
            .collect()
    }

    fn deliver(&self, from: u32, to: Option<u32>, bytes: &[u8]) {
        for (index, handle) in self.targets(from, to) {
            if let Err(e) = handle.on_message(bytes) {
                debug!(from, to = index, error = %e, "Local delivery rejected");
            }
        }
    }
}

struct LocalEndpoint {
    hub: Arc<LocalNetwork>,
    index: u32,
}

#[async_trait]
impl Network for LocalEndpoint {
    async fn broadcast(&self, bytes: Vec<u8>) -> ConsensusResult<()> {
        self.hub.deliver(self.index, None, &bytes);
        Ok(())
    }

    async fn send_to(&self, index: u32, bytes: Vec<u8>) -> ConsensusResult<()> {
        self.hub.deliver(self.index, Some(index), &bytes);
        Ok(())
    }
}
