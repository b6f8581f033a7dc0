//! Work-in-progress batch.

use moraine_primitives::{
    Address, BatchConstraints, BatchResources, ClosingReason, ExitRoot, StateRoot,
};

/// The open batch as seen by the finalizer's control loop.
///
/// `state_root` and `remaining` are the *immediate* view advanced by the
/// per-transaction trial executions; the pipeline keeps its own final view
/// that advances as whole sub-blocks execute (see
/// [`crate::pipeline::SharedFinalView`]). Only the control loop mutates
/// this struct.
#[derive(Debug, Clone)]
pub struct WipBatch {
    pub number: u64,
    pub coinbase: Address,
    pub timestamp: u64,

    /// Root the batch opened on.
    pub initial_state_root: StateRoot,

    /// Root after the last trial execution.
    pub state_root: StateRoot,
    pub local_exit_root: ExitRoot,

    /// Exit root the batch was opened with.
    pub exit_root: ExitRoot,

    /// Budget left under the immediate view.
    pub remaining: BatchResources,

    pub tx_count: u64,
    pub block_count: u64,
    pub closing_reason: ClosingReason,
}

impl WipBatch {
    /// A fresh batch holding the full constraint budget.
    pub fn open(
        number: u64,
        coinbase: Address,
        timestamp: u64,
        state_root: StateRoot,
        exit_root: ExitRoot,
        constraints: &BatchConstraints,
    ) -> Self {
        Self {
            number,
            coinbase,
            timestamp,
            initial_state_root: state_root,
            state_root,
            local_exit_root: ExitRoot::zero(),
            exit_root,
            remaining: constraints.as_resources(),
            tx_count: 0,
            block_count: 0,
            closing_reason: ClosingReason::StillOpen,
        }
    }

    /// Rebuilds the in-memory view of a persisted WIP batch: the budget is
    /// the constraints minus what the stored blocks already used.
    pub fn resume(
        record: &moraine_db::WipBatchRecord,
        constraints: &BatchConstraints,
    ) -> Result<Self, moraine_primitives::ResourceOverflow> {
        let mut remaining = constraints.as_resources();
        remaining.checked_sub(&record.used_resources)?;

        Ok(Self {
            number: record.number,
            coinbase: record.coinbase,
            timestamp: record.timestamp,
            initial_state_root: record.initial_state_root,
            state_root: record.state_root,
            local_exit_root: record.local_exit_root,
            exit_root: record.exit_root,
            remaining,
            tx_count: 0,
            block_count: record.block_count,
            closing_reason: ClosingReason::StillOpen,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tx_count == 0
    }

    /// Whether any dimension of the remaining budget has dropped to or
    /// under `pct` percent of its constraint. Returns the first dimension
    /// that did.
    pub fn under_threshold(
        &self,
        constraints: &BatchConstraints,
        pct: u8,
    ) -> Option<moraine_primitives::ResourceName> {
        use moraine_primitives::ResourceName::*;

        let z = &self.remaining.zk_counters;
        let threshold = |max: u64| max.saturating_mul(u64::from(pct)) / 100;

        let checks = [
            (Bytes, self.remaining.bytes, constraints.max_bytes),
            (
                CumulativeGasUsed,
                z.cumulative_gas_used,
                constraints.max_cumulative_gas_used,
            ),
            (KeccakHashes, z.keccak_hashes, constraints.max_keccak_hashes),
            (
                PoseidonHashes,
                z.poseidon_hashes,
                constraints.max_poseidon_hashes,
            ),
            (
                PoseidonPaddings,
                z.poseidon_paddings,
                constraints.max_poseidon_paddings,
            ),
            (MemAligns, z.mem_aligns, constraints.max_mem_aligns),
            (Arithmetics, z.arithmetics, constraints.max_arithmetics),
            (Binaries, z.binaries, constraints.max_binaries),
            (Steps, z.steps, constraints.max_steps),
        ];

        checks
            .into_iter()
            .find(|(_, left, max)| *left <= threshold(*max))
            .map(|(name, _, _)| name)
    }
}
