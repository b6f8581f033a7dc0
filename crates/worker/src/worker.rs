//! The worker: admission and selection authority.

use std::{collections::HashMap, sync::Arc};

use ethnum::U256;
use moraine_db::{PendingTx, StateReader};
use moraine_engine::AccountUpdate;
use moraine_primitives::{Address, BatchConstraints, BatchResources, TxHash};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::*;

use crate::{
    addr_queue::{AddrQueue, ReadyTransition},
    arena::TxArena,
    errors::{WorkerError, WorkerResult},
    list::{EfficiencyKey, EfficiencyList},
    score::EfficiencyScorer,
    tracker::TxTracker,
};

/// A transaction the worker gave up on, to be reported to the pool.
#[derive(Debug, Clone)]
pub struct DroppedTx {
    pub hash: TxHash,
    pub from: Address,
    pub reason: String,
}

/// Admission and selection core.
///
/// One arena of trackers, one queue per sender, one global efficiency
/// index. Queue and index mutations happen under the worker lock as one
/// atomic step, so the index always contains exactly the ready set.
/// Lock order is the worker lock before the index's internal lock.
pub struct Worker<S> {
    inner: Mutex<WorkerInner>,
    list: EfficiencyList,
    state: Arc<S>,
    constraints: BatchConstraints,
    scorer: Arc<dyn EfficiencyScorer>,
    ready_notify: Arc<Notify>,
}

impl<S> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("ready", &self.list.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct WorkerInner {
    arena: TxArena,
    queues: HashMap<Address, AddrQueue>,
}

impl<S: StateReader> Worker<S> {
    pub fn new(
        state: Arc<S>,
        constraints: BatchConstraints,
        scorer: Arc<dyn EfficiencyScorer>,
    ) -> Self {
        Self {
            inner: Mutex::new(WorkerInner::default()),
            list: EfficiencyList::new(),
            state,
            constraints,
            scorer,
            ready_notify: Arc::new(Notify::new()),
        }
    }

    /// Notified when the ready set transitions from empty to non-empty.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready_notify.clone()
    }

    /// Number of currently ready transactions.
    pub fn ready_count(&self) -> usize {
        self.list.len()
    }

    /// Admits a pool candidate. Returns the hash it replaced, if any, for
    /// pool reporting.
    pub async fn add_tx(&self, pending: PendingTx) -> WorkerResult<Option<TxHash>> {
        let tx = TxTracker::new(pending, self.scorer.as_ref());

        // Node-level pre-check: a candidate that can't fit an empty batch
        // can never be selected.
        if !self.constraints.accepts(&tx.reserved_resources) {
            error!(txh = %tx.hash, "candidate exceeds batch constraints");
            return Err(WorkerError::OutOfCounters);
        }

        let from = tx.from;
        let txh = tx.hash;
        let nonce = tx.nonce;

        let (transition, replaced) = loop {
            // Read the sender's account outside the lock; only needed when
            // this is the sender's first queued transaction.
            let account = if self.inner.lock().queues.contains_key(&from) {
                None
            } else {
                let root = self.state.last_state_root().await?;
                let account_nonce = self.state.nonce_at(root, from).await?;
                let balance = self.state.balance_at(root, from).await?;
                Some((account_nonce, balance))
            };

            let mut inner = self.inner.lock();
            let WorkerInner { arena, queues } = &mut *inner;
            let queue = match queues.entry(from) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    // The queue may have emptied out between the two lock
                    // scopes; without fresh account data, start over.
                    let Some((account_nonce, balance)) = account else {
                        drop(inner);
                        continue;
                    };
                    debug!(addr = %from, nonce = %account_nonce, "created addr queue");
                    e.insert(AddrQueue::new(from, account_nonce, balance))
                }
            };

            break queue.add_tx(arena, tx)?;
        };

        debug!(%txh, %nonce, addr = %from, "admitted tx");
        self.apply_transition(transition);
        if let Some(replaced) = &replaced {
            debug!(txh = %replaced, addr = %from, "tx replaced by better price");
        }
        Ok(replaced)
    }

    /// Propagates the nonce/balance side effects of an executed
    /// transaction into every touched sender's queue. Returns the
    /// transactions that became permanently invalid.
    pub fn update_after_successful_execution(
        &self,
        from: Address,
        touched: &HashMap<Address, AccountUpdate>,
    ) -> Vec<DroppedTx> {
        if touched.is_empty() {
            warn!(addr = %from, "executed tx reported no touched accounts");
        }

        let mut dropped = Vec::new();

        // The sender first, with both nonce and balance.
        if let Some(update) = touched.get(&from) {
            dropped.extend(self.apply_address_update(from, update.nonce, update.balance));
        } else {
            warn!(addr = %from, "sender missing from touched accounts");
        }

        // Everyone else only has balance movements.
        for (addr, update) in touched {
            if *addr != from {
                dropped.extend(self.apply_address_update(*addr, None, update.balance));
            }
        }

        dropped
    }

    /// Explicit correction: the supposedly ready tx failed to execute,
    /// re-evaluate the sender against its actual account state.
    pub fn move_tx_to_not_ready(
        &self,
        hash: &TxHash,
        from: Address,
        actual_nonce: Option<u64>,
        actual_balance: Option<U256>,
    ) -> Vec<DroppedTx> {
        {
            let inner = self.inner.lock();
            if let Some(queue) = inner.queues.get(&from) {
                if queue.ready_hash() != Some(*hash) {
                    warn!(txh = %hash, addr = %from, "tx to move is not the ready tx");
                }
            }
        }
        self.apply_address_update(from, actual_nonce, actual_balance)
    }

    /// Removes a transaction outright.
    pub fn delete_tx(&self, hash: &TxHash, from: Address) {
        let mut inner = self.inner.lock();
        let WorkerInner { arena, queues } = &mut *inner;
        let Some(queue) = queues.get_mut(&from) else {
            warn!(addr = %from, "addr queue not found");
            return;
        };
        let prev_ready = queue.delete_tx(arena, hash);
        let emptied = queue.is_empty();
        if emptied {
            queues.remove(&from);
        }
        drop(inner);

        if let Some(key) = prev_ready {
            self.list.delete(&key);
        }
    }

    /// Pins a forced transaction's hash to the sender's queue.
    pub fn add_forced_tx(&self, hash: TxHash, from: Address) {
        let mut inner = self.inner.lock();
        let queue = inner
            .queues
            .entry(from)
            .or_insert_with(|| AddrQueue::new(from, 0, U256::ZERO));
        queue.add_forced_tx(hash);
    }

    /// Unpins a forced transaction.
    pub fn delete_forced_tx(&self, hash: &TxHash, from: Address) {
        let mut inner = self.inner.lock();
        match inner.queues.get_mut(&from) {
            Some(queue) => {
                queue.delete_forced_tx(hash);
                if queue.is_empty() {
                    inner.queues.remove(&from);
                }
            }
            None => warn!(addr = %from, "addr queue not found"),
        }
    }

    /// Pins a tx that awaits durable storage.
    pub fn add_pending_tx_to_store(&self, hash: TxHash, from: Address) {
        let mut inner = self.inner.lock();
        match inner.queues.get_mut(&from) {
            Some(queue) => queue.add_pending_store(hash),
            None => warn!(addr = %from, "addr queue not found"),
        }
    }

    /// Unpins a durably stored tx.
    pub fn delete_pending_tx_to_store(&self, hash: &TxHash, from: Address) {
        let mut inner = self.inner.lock();
        match inner.queues.get_mut(&from) {
            Some(queue) => {
                queue.delete_pending_store(hash);
                if queue.is_empty() {
                    inner.queues.remove(&from);
                }
            }
            None => warn!(addr = %from, "addr queue not found"),
        }
    }

    /// Replaces a tracker's footprint estimate after the engine reported
    /// the actual usage.
    pub fn update_tx_resources(&self, hash: &TxHash, from: Address, reserved: BatchResources) {
        let mut inner = self.inner.lock();
        let WorkerInner { arena, queues } = &mut *inner;
        let Some(queue) = queues.get_mut(&from) else {
            warn!(addr = %from, "addr queue not found");
            return;
        };
        let rekey = queue.update_tx_resources(arena, hash, reserved, self.scorer.as_ref());
        drop(inner);

        if let Some((old, new)) = rekey {
            self.list.delete(&old);
            self.add_to_list(new);
        }
    }

    /// Most efficient ready transaction whose footprint fits `remaining`.
    ///
    /// Never mutates `remaining`; the caller subtracts for real only when
    /// it commits the transaction. Distinguishes "nothing ready" from
    /// "ready but nothing fits".
    pub fn get_best_fitting_tx(&self, remaining: &BatchResources) -> WorkerResult<TxTracker> {
        let inner = self.inner.lock();

        if self.list.is_empty() {
            return Err(WorkerError::NoReadyTxs);
        }

        // The index is stable while we hold the worker lock; the snapshot
        // is the efficiency-descending scan order.
        for key in self.list.snapshot() {
            let Some(tracker) = inner.arena.get(&key.hash) else {
                // Index/queue drift would be a worker bug.
                error!(txh = %key.hash, "ready tx missing from arena");
                continue;
            };
            if remaining.fits(&tracker.reserved_resources).is_ok() {
                debug!(txh = %key.hash, eff = key.score, "selected best fitting tx");
                return Ok(tracker.clone());
            }
        }

        Err(WorkerError::NoFittingTx)
    }

    /// Drops candidates older than `max_age_secs` relative to `now`.
    pub fn expire_txs(&self, max_age_secs: u64, now: u64) -> Vec<DroppedTx> {
        let cutoff = now.saturating_sub(max_age_secs);
        let mut dropped = Vec::new();
        let mut prev_ready_keys = Vec::new();

        {
            let mut inner = self.inner.lock();
            let WorkerInner { arena, queues } = &mut *inner;
            for queue in queues.values_mut() {
                let (d, prev_ready) = queue.expire(arena, cutoff);
                dropped.extend(d);
                prev_ready_keys.extend(prev_ready);
            }
            queues.retain(|_, q| !q.is_empty());
        }

        for key in prev_ready_keys {
            self.list.delete(&key);
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), "expired stale candidates");
        }
        dropped
    }

    /// The ready-set invariant: the index holds exactly the queues' ready
    /// hashes. Checked by tests after every mutation batch.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let ready: std::collections::HashSet<TxHash> = inner
            .queues
            .values()
            .filter_map(|q| q.ready_hash())
            .collect();
        let listed: std::collections::HashSet<TxHash> =
            self.list.snapshot().iter().map(|k| k.hash).collect();
        ready == listed
    }

    fn apply_address_update(
        &self,
        addr: Address,
        nonce: Option<u64>,
        balance: Option<U256>,
    ) -> Vec<DroppedTx> {
        let mut inner = self.inner.lock();
        let WorkerInner { arena, queues } = &mut *inner;
        let Some(queue) = queues.get_mut(&addr) else {
            return Vec::new();
        };

        let (transition, dropped) = queue.update_nonce_balance(arena, nonce, balance);
        if queue.is_empty() {
            queues.remove(&addr);
        }
        drop(inner);

        self.apply_transition(transition);
        dropped
    }

    fn apply_transition(&self, transition: ReadyTransition) {
        if let Some(prev) = transition.prev_ready {
            self.list.delete(&prev);
        }
        if let Some(new) = transition.new_ready {
            self.add_to_list(new);
        }
    }

    fn add_to_list(&self, key: EfficiencyKey) {
        if self.list.add(key) && self.list.len() == 1 {
            // The ready set just became non-empty, wake the selector.
            self.ready_notify.notify_waiters();
        }
    }
}
