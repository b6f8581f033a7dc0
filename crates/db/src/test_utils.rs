//! In-memory backend for tests.
//!
//! One `MemBackend` plays all three boundary roles (store, state reader,
//! pool) so a test can wire a whole sequencer against a single object and
//! inspect what got persisted.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ethnum::U256;
use moraine_primitives::{Address, BatchResources, StateRoot, TxHash};
use parking_lot::Mutex;

use crate::{
    errors::{DbError, DbResult},
    traits::{SequencerDb, StateReader, TxPool},
    types::{
        BatchReceipt, ExitRootUpdate, ForcedBatch, OpenBatchParams, PendingTx, StoredBlock,
        TxStatus, WipBatchRecord,
    },
};

#[derive(Debug, Default)]
struct BatchRec {
    params: OpenBatchParams,
    initial_state_root: StateRoot,
    state_root: StateRoot,
    blocks: Vec<StoredBlock>,
    used: BatchResources,
    receipt: Option<BatchReceipt>,
}

#[derive(Debug, Default)]
struct MemState {
    batches: BTreeMap<u64, BatchRec>,
    durable_flush_id: u64,
    engine_instance: String,
    forced: BTreeMap<u64, ForcedBatch>,
    last_trusted_forced: u64,
    exit_roots: Vec<ExitRootUpdate>,
    l1_head: u64,
    last_virtualized_ts: u64,
    synced: bool,
    accounts: HashMap<Address, (u64, U256)>,
    last_state_root: StateRoot,
    pool: Vec<PendingTx>,
    pool_status: HashMap<TxHash, (TxStatus, Option<String>)>,
    unavailable: bool,
}

/// Shared in-memory store/state/pool.
#[derive(Debug, Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

impl MemBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state.lock().synced = true;
        backend
    }

    // -- test knobs --

    pub fn set_account(&self, addr: Address, nonce: u64, balance: U256) {
        self.state.lock().accounts.insert(addr, (nonce, balance));
    }

    pub fn set_last_state_root(&self, root: StateRoot) {
        self.state.lock().last_state_root = root;
    }

    pub fn set_durable_flush(&self, flush_id: u64, instance: &str) {
        let mut st = self.state.lock();
        st.durable_flush_id = flush_id;
        st.engine_instance = instance.to_owned();
    }

    pub fn set_l1_head(&self, height: u64) {
        self.state.lock().l1_head = height;
    }

    pub fn set_last_virtualized_ts(&self, ts: u64) {
        self.state.lock().last_virtualized_ts = ts;
    }

    pub fn set_synced(&self, synced: bool) {
        self.state.lock().synced = synced;
    }

    /// Makes every operation fail with a retryable error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn push_forced_batch(&self, fb: ForcedBatch) {
        self.state.lock().forced.insert(fb.number, fb);
    }

    pub fn set_last_trusted_forced(&self, number: u64) {
        self.state.lock().last_trusted_forced = number;
    }

    pub fn push_exit_root(&self, update: ExitRootUpdate) {
        self.state.lock().exit_roots.push(update);
    }

    pub fn push_pool_tx(&self, tx: PendingTx) {
        let mut st = self.state.lock();
        st.pool_status.insert(tx.hash, (TxStatus::Pending, None));
        st.pool.push(tx);
    }

    // -- test inspection --

    pub fn batch_block_count(&self, number: u64) -> usize {
        self.state
            .lock()
            .batches
            .get(&number)
            .map(|b| b.blocks.len())
            .unwrap_or(0)
    }

    pub fn batch_receipt(&self, number: u64) -> Option<BatchReceipt> {
        self.state
            .lock()
            .batches
            .get(&number)
            .and_then(|b| b.receipt.clone())
    }

    pub fn batch_forced_number(&self, number: u64) -> Option<u64> {
        self.state
            .lock()
            .batches
            .get(&number)
            .and_then(|b| b.params.forced_batch_number)
    }

    pub fn stored_block_flush_ids(&self, number: u64) -> Vec<u64> {
        self.state
            .lock()
            .batches
            .get(&number)
            .map(|b| b.blocks.iter().map(|blk| blk.exec.flush_id).collect())
            .unwrap_or_default()
    }

    pub fn pool_status(&self, hash: &TxHash) -> Option<TxStatus> {
        self.state.lock().pool_status.get(hash).map(|(s, _)| *s)
    }

    fn check_available(st: &MemState) -> DbResult<()> {
        if st.unavailable {
            return Err(DbError::Unavailable("mem backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SequencerDb for MemBackend {
    async fn last_batch_number(&self) -> DbResult<u64> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.batches.keys().next_back().copied().unwrap_or(0))
    }

    async fn is_batch_closed(&self, number: u64) -> DbResult<bool> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        let batch = st
            .batches
            .get(&number)
            .ok_or(DbError::MissingBatch(number))?;
        Ok(batch.receipt.is_some())
    }

    async fn batch_state_root(&self, number: u64) -> DbResult<StateRoot> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        let batch = st
            .batches
            .get(&number)
            .ok_or(DbError::MissingBatch(number))?;
        Ok(batch.state_root)
    }

    async fn open_batch(&self, params: OpenBatchParams) -> DbResult<()> {
        let mut st = self.state.lock();
        Self::check_available(&st)?;
        if st.batches.contains_key(&params.number) {
            return Err(DbError::BatchAlreadyOpen(params.number));
        }
        let initial_state_root = st
            .batches
            .values()
            .next_back()
            .map(|b| b.state_root)
            .unwrap_or(st.last_state_root);
        if let Some(forced) = params.forced_batch_number {
            st.last_trusted_forced = st.last_trusted_forced.max(forced);
        }
        let number = params.number;
        st.batches.insert(
            number,
            BatchRec {
                params,
                initial_state_root,
                state_root: initial_state_root,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn close_batch(&self, receipt: BatchReceipt) -> DbResult<()> {
        let mut st = self.state.lock();
        Self::check_available(&st)?;
        let batch = st
            .batches
            .get_mut(&receipt.number)
            .ok_or(DbError::MissingBatch(receipt.number))?;
        if batch.receipt.is_some() {
            return Err(DbError::BatchNotOpen(receipt.number));
        }
        batch.state_root = receipt.state_root;
        batch.receipt = Some(receipt);
        Ok(())
    }

    async fn wip_batch(&self) -> DbResult<Option<WipBatchRecord>> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        let Some(batch) = st.batches.values().next_back() else {
            return Ok(None);
        };
        if batch.receipt.is_some() {
            return Ok(None);
        }
        Ok(Some(WipBatchRecord {
            number: batch.params.number,
            coinbase: batch.params.coinbase,
            timestamp: batch.params.timestamp,
            initial_state_root: batch.initial_state_root,
            state_root: batch.state_root,
            local_exit_root: Default::default(),
            exit_root: batch.params.exit_root,
            used_resources: batch.used,
            block_count: batch.blocks.len() as u64,
        }))
    }

    async fn store_block(&self, block: StoredBlock) -> DbResult<()> {
        let mut st = self.state.lock();
        Self::check_available(&st)?;
        let batch = st
            .batches
            .get_mut(&block.batch_number)
            .ok_or(DbError::MissingBatch(block.batch_number))?;
        batch.state_root = block.exec.new_state_root;
        batch.used.sum_up(&block.exec.used_resources);
        batch.blocks.push(block);
        Ok(())
    }

    async fn last_durable_flush_id(&self) -> DbResult<(u64, String)> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok((st.durable_flush_id, st.engine_instance.clone()))
    }

    async fn last_trusted_forced_batch_number(&self) -> DbResult<u64> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.last_trusted_forced)
    }

    async fn forced_batches_since(
        &self,
        after: u64,
        max_l1_block: u64,
    ) -> DbResult<Vec<ForcedBatch>> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st
            .forced
            .range(after + 1..)
            .map(|(_, fb)| fb)
            .filter(|fb| fb.l1_block <= max_l1_block)
            .cloned()
            .collect())
    }

    async fn forced_batch(&self, number: u64) -> DbResult<ForcedBatch> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        st.forced
            .get(&number)
            .cloned()
            .ok_or(DbError::MissingForcedBatch(number))
    }

    async fn latest_exit_root(&self, max_l1_block: u64) -> DbResult<Option<ExitRootUpdate>> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st
            .exit_roots
            .iter()
            .filter(|u| u.l1_block <= max_l1_block)
            .max_by_key(|u| u.l1_block)
            .cloned())
    }

    async fn l1_head_block(&self) -> DbResult<u64> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.l1_head)
    }

    async fn last_virtualized_batch_timestamp(&self) -> DbResult<u64> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.last_virtualized_ts)
    }

    async fn is_synced(&self) -> DbResult<bool> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.synced)
    }
}

#[async_trait]
impl StateReader for MemBackend {
    async fn last_state_root(&self) -> DbResult<StateRoot> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.last_state_root)
    }

    async fn nonce_at(&self, _root: StateRoot, addr: Address) -> DbResult<u64> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st.accounts.get(&addr).map(|(n, _)| *n).unwrap_or(0))
    }

    async fn balance_at(&self, _root: StateRoot, addr: Address) -> DbResult<U256> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st
            .accounts
            .get(&addr)
            .map(|(_, b)| *b)
            .unwrap_or(U256::ZERO))
    }
}

#[async_trait]
impl TxPool for MemBackend {
    async fn ready_candidates(&self, limit: usize) -> DbResult<Vec<PendingTx>> {
        let st = self.state.lock();
        Self::check_available(&st)?;
        Ok(st
            .pool
            .iter()
            .filter(|tx| {
                matches!(
                    st.pool_status.get(&tx.hash),
                    Some((TxStatus::Pending, _)) | None
                )
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_selected(&self, hash: TxHash) -> DbResult<()> {
        self.mark(hash, TxStatus::Selected, None)
    }

    async fn mark_failed(&self, hash: TxHash, reason: &str) -> DbResult<()> {
        self.mark(hash, TxStatus::Failed, Some(reason.to_owned()))
    }

    async fn mark_invalid(&self, hash: TxHash, reason: &str) -> DbResult<()> {
        self.mark(hash, TxStatus::Invalid, Some(reason.to_owned()))
    }

    async fn mark_pending(&self, hash: TxHash) -> DbResult<()> {
        self.mark(hash, TxStatus::Pending, None)
    }
}

impl MemBackend {
    fn mark(&self, hash: TxHash, status: TxStatus, reason: Option<String>) -> DbResult<()> {
        let mut st = self.state.lock();
        Self::check_available(&st)?;
        st.pool_status.insert(hash, (status, reason));
        Ok(())
    }
}
