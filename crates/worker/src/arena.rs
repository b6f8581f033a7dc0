//! Tracker arena.

use std::collections::HashMap;

use moraine_primitives::TxHash;

use crate::tracker::TxTracker;

/// Single owner of every admitted tracker. Queues and the efficiency index
/// refer to entries by hash; removing a hash here is what destroys a
/// tracker.
#[derive(Debug, Default)]
pub(crate) struct TxArena {
    txs: HashMap<TxHash, TxTracker>,
}

impl TxArena {
    pub(crate) fn insert(&mut self, tx: TxTracker) {
        self.txs.insert(tx.hash, tx);
    }

    pub(crate) fn remove(&mut self, hash: &TxHash) -> Option<TxTracker> {
        self.txs.remove(hash)
    }

    pub(crate) fn get(&self, hash: &TxHash) -> Option<&TxTracker> {
        self.txs.get(hash)
    }

    pub(crate) fn get_mut(&mut self, hash: &TxHash) -> Option<&mut TxTracker> {
        self.txs.get_mut(hash)
    }

    pub(crate) fn len(&self) -> usize {
        self.txs.len()
    }
}
