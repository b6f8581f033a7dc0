//! Scheduling record of one admitted transaction.

use ethnum::U256;
use moraine_db::PendingTx;
use moraine_primitives::{Address, BatchResources, TxHash};

use crate::score::EfficiencyScorer;

/// Everything the worker needs to schedule one candidate transaction.
#[derive(Debug, Clone)]
pub struct TxTracker {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: U256,

    /// Value plus max fee, checked against the sender's balance.
    pub cost: U256,

    /// What the sequencer earns by including it: `gas * gas_price`.
    pub benefit: U256,

    /// Pre-estimated footprint used for fit checks, byte size included.
    pub reserved_resources: BatchResources,

    /// Score under the current policy; recomputed when the footprint is
    /// corrected.
    pub efficiency: f64,

    pub raw: Vec<u8>,
    pub received_at: u64,
    pub submitter: Option<String>,
}

impl TxTracker {
    /// Builds a tracker from a pool candidate and scores it.
    pub fn new(pending: PendingTx, scorer: &dyn EfficiencyScorer) -> Self {
        let mut reserved = pending.reserved_resources;
        reserved.bytes = pending.raw.len() as u64;

        let benefit = U256::from(pending.gas) * pending.gas_price;
        let efficiency = scorer.score(benefit, &reserved);

        Self {
            hash: pending.hash,
            from: pending.from,
            nonce: pending.nonce,
            gas: pending.gas,
            gas_price: pending.gas_price,
            cost: pending.cost,
            benefit,
            reserved_resources: reserved,
            efficiency,
            raw: pending.raw,
            received_at: pending.received_at,
            submitter: pending.submitter,
        }
    }

    /// Replaces the footprint estimate and rescores.
    pub fn update_resources(&mut self, reserved: BatchResources, scorer: &dyn EfficiencyScorer) {
        self.reserved_resources = reserved;
        self.reserved_resources.bytes = self.raw.len() as u64;
        self.efficiency = scorer.score(self.benefit, &self.reserved_resources);
    }
}
