//! Ledger adapter.
//!
//! The consensus core reads the chain tip through [`Ledger`] and hands it
//! finalized blocks to append. Appends may block; the runner dispatches
//! them off the event loop.

use crate::block::Block;
use crate::{ConsensusError, ConsensusResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Block storage consulted by the state machine.
pub trait Ledger: Send + Sync {
    /// Height of the last appended block.
    fn current_height(&self) -> u32;

    /// Block at `height`, if stored.
    fn block_by_height(&self, height: u32) -> Option<Block>;

    /// Appends the next block. Implementations check it extends the tip.
    fn add_block(&self, block: Block) -> ConsensusResult<()>;
}

/// In-memory ledger starting from a genesis block.
#[derive(Debug)]
pub struct MemoryLedger {
    blocks: RwLock<Vec<Block>>,
    failures: AtomicU32,
}

impl MemoryLedger {
    pub fn new(genesis: Block) -> Self {
        Self {
            blocks: RwLock::new(vec![genesis]),
            failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` appends fail.
    pub fn fail_next_appends(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The last appended block.
    pub fn tip(&self) -> Block {
        let blocks = self.blocks.read();
        // The genesis block is never removed
        blocks[blocks.len() - 1].clone()
    }

    /// Hashes of every stored block, genesis first.
    pub fn block_hashes(&self) -> Vec<vbft_cryptography::Hash256> {
        self.blocks.read().iter().map(Block::hash).collect()
    }
}

impl Ledger for MemoryLedger {
    fn current_height(&self) -> u32 {
        (self.blocks.read().len() - 1) as u32
    }

    fn block_by_height(&self, height: u32) -> Option<Block> {
        self.blocks.read().get(height as usize).cloned()
    }

    fn add_block(&self, block: Block) -> ConsensusResult<()> {
        let height = block.height();
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConsensusError::LedgerAppendFailed {
                height,
                message: "injected failure".to_string(),
            });
        }

        let mut blocks = self.blocks.write();
        let tip = &blocks[blocks.len() - 1];
        if height != tip.height() + 1 {
            return Err(ConsensusError::LedgerAppendFailed {
                height,
                message: format!("expected height {}", tip.height() + 1),
            });
        }
        if block.header.prev_hash != tip.hash() {
            return Err(ConsensusError::LedgerAppendFailed {
                height,
                message: "block does not extend the tip".to_string(),
            });
        }
        debug!(height, hash = %block.hash(), "Block appended");
        blocks.push(block);
        Ok(())
    }
}
