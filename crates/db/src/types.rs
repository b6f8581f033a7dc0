//! Shared types crossing the persistence boundary.

use ethnum::U256;
use moraine_engine::BlockExecOutput;
use moraine_primitives::{Address, BatchResources, ClosingReason, ExitRoot, StateRoot, TxHash};
use serde::{Deserialize, Serialize};

/// Parameters for opening a batch in the store.
#[derive(Debug, Clone, Default)]
pub struct OpenBatchParams {
    pub number: u64,
    pub coinbase: Address,
    pub timestamp: u64,
    pub exit_root: ExitRoot,

    /// Set when the batch materializes a forced batch.
    pub forced_batch_number: Option<u64>,
}

/// Receipt closing a batch in the store.
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub number: u64,
    pub state_root: StateRoot,
    pub local_exit_root: ExitRoot,
    pub used_resources: BatchResources,
    pub closing_reason: ClosingReason,
}

/// A work-in-progress batch as persisted, for resume after restart.
#[derive(Debug, Clone)]
pub struct WipBatchRecord {
    pub number: u64,
    pub coinbase: Address,
    pub timestamp: u64,
    pub initial_state_root: StateRoot,
    pub state_root: StateRoot,
    pub local_exit_root: ExitRoot,
    pub exit_root: ExitRoot,

    /// Resources consumed so far; remaining budget is constraints minus
    /// this.
    pub used_resources: BatchResources,

    /// Number of blocks already stored for this batch.
    pub block_count: u64,
}

/// A fully executed sub-block handed to the store.
#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub batch_number: u64,

    /// Finalizer-local sequence number, for log correlation only.
    pub tracking_num: u64,
    pub timestamp: u64,
    pub delta_timestamp: u32,

    /// Exit root incorporated by this block, if it changed.
    pub exit_root: Option<ExitRoot>,

    /// Raw payloads in execution order, as submitted to the engine.
    pub raw_txs: Vec<Vec<u8>>,

    /// The engine's response for the block.
    pub exec: BlockExecOutput,
}

/// A forced batch read from the L1 inclusion records.
#[derive(Debug, Clone)]
pub struct ForcedBatch {
    /// Strictly increasing forced-sequence number.
    pub number: u64,

    /// L1 block that included the forcing event.
    pub l1_block: u64,
    pub exit_root: ExitRoot,
    pub raw_txs: Vec<u8>,
    pub forced_at: u64,
}

/// A finality-confirmed exit-root update.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExitRootUpdate {
    pub root: ExitRoot,
    pub l1_block: u64,
    pub timestamp: u64,
}

/// Pool-side status of a candidate transaction.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Selected,
    Failed,
    Invalid,
}

/// A candidate transaction handed over by the pool.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: U256,

    /// Value plus max fee; what the sender must be able to afford.
    pub cost: U256,
    pub raw: Vec<u8>,

    /// Footprint the pool pre-estimated for admission checks.
    pub reserved_resources: BatchResources,
    pub received_at: u64,

    /// Opaque submitter tag carried through for pool reporting.
    pub submitter: Option<String>,
}
