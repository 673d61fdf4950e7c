//! Transaction pool adapter.
//!
//! Supplies pending transactions to the leader and validates the
//! transactions of incoming proposals.

use crate::block::{Transaction, MAX_TRANSACTION_SIZE};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use vbft_cryptography::Hash256;

/// Source and validator of transactions.
pub trait TxPool: Send + Sync {
    /// Up to `max` transactions in arrival order.
    fn pending_transactions(&self, max: usize) -> Vec<Transaction>;

    /// Stateless validity check for a proposed transaction.
    fn validate_transaction(&self, tx: &Transaction) -> bool;

    /// Drops transactions included in a committed block.
    fn remove_transactions(&self, txs: &[Transaction]);
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<Transaction>,
    known: HashSet<Hash256>,
}

/// FIFO in-memory pool accepting any non-empty payload up to
/// [`MAX_TRANSACTION_SIZE`].
#[derive(Debug, Default)]
pub struct MemoryTxPool {
    state: Mutex<PoolState>,
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transaction. Returns false for invalid or duplicate ones.
    pub fn add(&self, tx: Transaction) -> bool {
        if !self.validate_transaction(&tx) {
            return false;
        }
        let mut state = self.state.lock();
        if !state.known.insert(tx.hash()) {
            return false;
        }
        state.queue.push_back(tx);
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TxPool for MemoryTxPool {
    fn pending_transactions(&self, max: usize) -> Vec<Transaction> {
        self.state.lock().queue.iter().take(max).cloned().collect()
    }

    fn validate_transaction(&self, tx: &Transaction) -> bool {
        !tx.as_bytes().is_empty() && tx.as_bytes().len() <= MAX_TRANSACTION_SIZE
    }

    fn remove_transactions(&self, txs: &[Transaction]) {
        let hashes: HashSet<Hash256> = txs.iter().map(Transaction::hash).collect();
        let mut state = self.state.lock();
        state.queue.retain(|tx| !hashes.contains(&tx.hash()));
        // Keep committed hashes in `known` so replays are not re-queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_limits() {
        let pool = MemoryTxPool::new();
        for i in 0..5u8 {
            assert!(pool.add(Transaction::new(vec![i + 1])));
        }
        assert!(!pool.add(Transaction::new(vec![1])));
        assert!(!pool.add(Transaction::new(vec![])));
        let pending = pool.pending_transactions(3);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0], Transaction::new(vec![1]));
    }

    #[test]
    fn test_remove_committed() {
        let pool = MemoryTxPool::new();
        pool.add(Transaction::new(vec![1]));
        pool.add(Transaction::new(vec![2]));
        pool.remove_transactions(&[Transaction::new(vec![1])]);
        assert_eq!(pool.pending_transactions(10), vec![Transaction::new(vec![2])]);
        assert!(!pool.add(Transaction::new(vec![1])));
    }
}
