//! Trait definitions for the store, state and pool boundaries.

use async_trait::async_trait;
use ethnum::U256;
use moraine_primitives::{Address, StateRoot, TxHash};

use crate::{
    errors::DbResult,
    types::{
        BatchReceipt, ExitRootUpdate, ForcedBatch, OpenBatchParams, PendingTx, StoredBlock,
        WipBatchRecord,
    },
};

/// Capability set of the authoritative sequencer store.
///
/// Every mutating operation is atomic on the implementation side.
#[async_trait]
pub trait SequencerDb: Send + Sync + 'static {
    // -- batch lifecycle --

    /// Number of the highest batch known to the store, 0 if none.
    async fn last_batch_number(&self) -> DbResult<u64>;

    /// Whether the given batch has been closed.
    async fn is_batch_closed(&self, number: u64) -> DbResult<bool>;

    /// State root of the given closed batch.
    async fn batch_state_root(&self, number: u64) -> DbResult<StateRoot>;

    /// Opens a batch.
    async fn open_batch(&self, params: OpenBatchParams) -> DbResult<()>;

    /// Closes a batch with its final receipt.
    async fn close_batch(&self, receipt: BatchReceipt) -> DbResult<()>;

    /// The still-open batch with its accumulated usage, if any.
    async fn wip_batch(&self) -> DbResult<Option<WipBatchRecord>>;

    // -- sub-blocks --

    /// Persists an executed sub-block and rolls its usage into the WIP
    /// batch record. Callers must have confirmed the block's flush id
    /// durable first.
    async fn store_block(&self, block: StoredBlock) -> DbResult<()>;

    // -- engine durability --

    /// The engine's durable flush id and the identity of the engine
    /// instance that reported it.
    async fn last_durable_flush_id(&self) -> DbResult<(u64, String)>;

    // -- forced batches --

    /// Highest forced-sequence number already materialized into a batch.
    async fn last_trusted_forced_batch_number(&self) -> DbResult<u64>;

    /// Forced batches with number > `after`, included at or below
    /// `max_l1_block`, ascending.
    async fn forced_batches_since(&self, after: u64, max_l1_block: u64)
        -> DbResult<Vec<ForcedBatch>>;

    /// A single forced batch by number.
    async fn forced_batch(&self, number: u64) -> DbResult<ForcedBatch>;

    // -- L1 view --

    /// Latest finality-confirmed exit-root update at or below
    /// `max_l1_block`.
    async fn latest_exit_root(&self, max_l1_block: u64) -> DbResult<Option<ExitRootUpdate>>;

    /// Height of the latest L1 block the synchronizer has processed.
    async fn l1_head_block(&self) -> DbResult<u64>;

    /// Timestamp of the most recent batch virtualization on L1.
    async fn last_virtualized_batch_timestamp(&self) -> DbResult<u64>;

    /// Whether the synchronizer has caught up with the trusted state.
    async fn is_synced(&self) -> DbResult<bool>;
}

/// Read-only account state lookups against a specific state root.
#[async_trait]
pub trait StateReader: Send + Sync + 'static {
    /// Root of the most recently executed state.
    async fn last_state_root(&self) -> DbResult<StateRoot>;

    async fn nonce_at(&self, root: StateRoot, addr: Address) -> DbResult<u64>;

    async fn balance_at(&self, root: StateRoot, addr: Address) -> DbResult<U256>;
}

/// The transaction pool boundary.
#[async_trait]
pub trait TxPool: Send + Sync + 'static {
    /// Pending candidates in pool order, at most `limit`.
    async fn ready_candidates(&self, limit: usize) -> DbResult<Vec<PendingTx>>;

    /// Marks a transaction as included in a stored block.
    async fn mark_selected(&self, hash: TxHash) -> DbResult<()>;

    /// Marks a transaction as failed; it may become valid again later.
    async fn mark_failed(&self, hash: TxHash, reason: &str) -> DbResult<()>;

    /// Marks a transaction as permanently invalid.
    async fn mark_invalid(&self, hash: TxHash, reason: &str) -> DbResult<()>;

    /// Returns a transaction to the pending set (reorg/eviction path).
    async fn mark_pending(&self, hash: TxHash) -> DbResult<()>;
}
