//! Per-sender transaction queue.
//!
//! Holds at most one ready transaction (nonce matches the sender's current
//! nonce and the cost is affordable) plus the not-ready ones keyed by
//! nonce. All tracker storage lives in the arena; the queue only holds
//! hashes.

use std::collections::{BTreeMap, HashSet};

use ethnum::U256;
use moraine_primitives::{Address, TxHash};
use tracing::*;

use crate::{
    arena::TxArena, errors::WorkerError, list::EfficiencyKey, score::EfficiencyScorer,
    tracker::TxTracker, worker::DroppedTx,
};

/// Ready-slot changes a queue mutation produced, for the caller to mirror
/// into the efficiency index.
#[derive(Debug, Default)]
pub(crate) struct ReadyTransition {
    /// The ready transaction after the mutation (possibly unchanged).
    pub(crate) new_ready: Option<EfficiencyKey>,

    /// The previously ready transaction this mutation displaced.
    pub(crate) prev_ready: Option<EfficiencyKey>,
}

#[derive(Debug)]
pub(crate) struct AddrQueue {
    from: Address,
    current_nonce: u64,
    current_balance: U256,
    ready: Option<TxHash>,
    not_ready: BTreeMap<u64, TxHash>,
    forced: HashSet<TxHash>,
    pending_store: HashSet<TxHash>,
}

impl AddrQueue {
    pub(crate) fn new(from: Address, nonce: u64, balance: U256) -> Self {
        Self {
            from,
            current_nonce: nonce,
            current_balance: balance,
            ready: None,
            not_ready: BTreeMap::new(),
            forced: HashSet::new(),
            pending_store: HashSet::new(),
        }
    }

    pub(crate) fn from(&self) -> Address {
        self.from
    }

    pub(crate) fn ready_hash(&self) -> Option<TxHash> {
        self.ready
    }

    fn ready_key(&self, arena: &TxArena) -> Option<EfficiencyKey> {
        self.ready.and_then(|h| arena.get(&h)).map(|t| EfficiencyKey {
            score: t.efficiency,
            hash: t.hash,
        })
    }

    /// Adds a tracker. On a same-nonce conflict the better-or-equal price
    /// wins (ties favor the incoming transaction); the loser is dropped.
    /// Returns the ready transition plus the replaced hash, already
    /// removed from the arena, for pool reporting.
    pub(crate) fn add_tx(
        &mut self,
        arena: &mut TxArena,
        tx: TxTracker,
    ) -> Result<(ReadyTransition, Option<TxHash>), WorkerError> {
        if self.current_nonce == tx.nonce {
            let ready_price = self.ready.and_then(|h| arena.get(&h)).map(|t| t.gas_price);
            if ready_price.is_some_and(|p| tx.gas_price < p) {
                // The queued ready tx has a strictly better price.
                return Err(WorkerError::DuplicateNonce);
            }

            let prev_ready = self.ready_key(arena);
            let old_ready = self.ready.take();
            let replaced = old_ready.filter(|h| *h != tx.hash);
            if let Some(h) = &replaced {
                arena.remove(h);
            }

            // Affordable means cost <= balance, equality included.
            if self.current_balance >= tx.cost {
                let key = EfficiencyKey {
                    score: tx.efficiency,
                    hash: tx.hash,
                };
                self.ready = Some(tx.hash);
                arena.insert(tx);
                return Ok((
                    ReadyTransition {
                        new_ready: Some(key),
                        prev_ready,
                    },
                    replaced,
                ));
            }

            // Right nonce but not affordable right now.
            self.not_ready.insert(tx.nonce, tx.hash);
            arena.insert(tx);
            return Ok((
                ReadyTransition {
                    new_ready: None,
                    prev_ready,
                },
                replaced,
            ));
        }

        if self.current_nonce > tx.nonce {
            return Err(WorkerError::StaleNonce);
        }

        // Future nonce, goes into the not-ready set.
        if let Some(existing) = self.not_ready.get(&tx.nonce).copied() {
            let existing_price = arena
                .get(&existing)
                .map(|t| t.gas_price)
                .unwrap_or(U256::ZERO);
            if tx.gas_price < existing_price {
                return Err(WorkerError::DuplicateNonce);
            }
            let replaced = (existing != tx.hash).then_some(existing);
            if let Some(h) = &replaced {
                arena.remove(h);
            }
            self.not_ready.insert(tx.nonce, tx.hash);
            arena.insert(tx);
            return Ok((ReadyTransition::default(), replaced));
        }

        self.not_ready.insert(tx.nonce, tx.hash);
        arena.insert(tx);
        Ok((ReadyTransition::default(), None))
    }

    /// Applies a fresh nonce/balance observation.
    ///
    /// In order: update balance; purge not-ready entries below the new
    /// nonce (they can never become valid); evict the ready tx if it no
    /// longer qualifies; promote the matching not-ready entry if
    /// affordable; re-file the evicted tx when its nonce is still ahead.
    pub(crate) fn update_nonce_balance(
        &mut self,
        arena: &mut TxArena,
        nonce: Option<u64>,
        balance: Option<U256>,
    ) -> (ReadyTransition, Vec<DroppedTx>) {
        let mut dropped = Vec::new();

        if let Some(balance) = balance {
            self.current_balance = balance;
        }

        if let Some(nonce) = nonce {
            if self.current_nonce != nonce {
                self.current_nonce = nonce;
                let stale: Vec<u64> = self
                    .not_ready
                    .range(..nonce)
                    .map(|(n, _)| *n)
                    .collect();
                for n in stale {
                    let hash = self.not_ready.remove(&n).expect("queue: stale entry");
                    arena.remove(&hash);
                    debug!(txh = %hash, addr = %self.from, %n, "purging stale not-ready tx");
                    dropped.push(DroppedTx {
                        hash,
                        from: self.from,
                        reason: WorkerError::StaleNonce.to_string(),
                    });
                }
            }
        }

        // Evict the ready tx if the nonce moved past it or it became
        // unaffordable.
        let mut evicted = None;
        let mut evicted_key = None;
        if let Some(h) = self.ready {
            let still_ready = arena
                .get(&h)
                .is_some_and(|t| t.nonce == self.current_nonce && t.cost <= self.current_balance);
            if !still_ready {
                evicted_key = self.ready_key(arena);
                evicted = self.ready.take();
            }
        }

        // Promote from the not-ready set if possible. The evicted tx is
        // intentionally not back in the set yet; if the nonce didn't
        // change it would just fail the same check again.
        if self.ready.is_none() {
            if let Some(h) = self.not_ready.get(&self.current_nonce).copied() {
                if arena
                    .get(&h)
                    .is_some_and(|t| t.cost <= self.current_balance)
                {
                    self.not_ready.remove(&self.current_nonce);
                    self.ready = Some(h);
                    debug!(txh = %h, addr = %self.from, "promoted not-ready tx to ready");
                }
            }
        }

        // Re-file the evicted tx if it is still ahead of the current
        // nonce; otherwise it leaves the queue (the pool still has it).
        if let Some(h) = evicted {
            let nonce_ahead = arena.get(&h).is_some_and(|t| t.nonce > self.current_nonce);
            if nonce_ahead {
                let n = arena.get(&h).expect("queue: evicted tracker").nonce;
                self.not_ready.insert(n, h);
            } else {
                arena.remove(&h);
            }
        }

        (
            ReadyTransition {
                new_ready: self.ready_key(arena),
                prev_ready: evicted_key,
            },
            dropped,
        )
    }

    /// Removes a transaction from whichever slot holds it, arena included.
    /// Returns its key if it was the ready one; promotion is the caller's
    /// job via a nonce/balance update, never automatic here.
    pub(crate) fn delete_tx(&mut self, arena: &mut TxArena, hash: &TxHash) -> Option<EfficiencyKey> {
        if self.ready == Some(*hash) {
            let key = self.ready_key(arena);
            self.ready = None;
            arena.remove(hash);
            return key;
        }

        if let Some(n) = self
            .not_ready
            .iter()
            .find(|(_, h)| *h == hash)
            .map(|(n, _)| *n)
        {
            self.not_ready.remove(&n);
            arena.remove(hash);
        }
        None
    }

    /// Rescores the tracker with a corrected footprint. Returns the
    /// (old, new) keys when it was the ready tx so the index can re-sort.
    pub(crate) fn update_tx_resources(
        &mut self,
        arena: &mut TxArena,
        hash: &TxHash,
        reserved: moraine_primitives::BatchResources,
        scorer: &dyn EfficiencyScorer,
    ) -> Option<(EfficiencyKey, EfficiencyKey)> {
        let is_ready = self.ready == Some(*hash);
        let tracker = arena.get_mut(hash)?;
        let old = EfficiencyKey {
            score: tracker.efficiency,
            hash: *hash,
        };
        tracker.update_resources(reserved, scorer);
        let new = EfficiencyKey {
            score: tracker.efficiency,
            hash: *hash,
        };
        is_ready.then_some((old, new))
    }

    /// Expires transactions older than `cutoff`.
    pub(crate) fn expire(
        &mut self,
        arena: &mut TxArena,
        cutoff: u64,
    ) -> (Vec<DroppedTx>, Option<EfficiencyKey>) {
        let mut dropped = Vec::new();

        let old: Vec<(u64, TxHash)> = self
            .not_ready
            .iter()
            .filter(|(_, h)| arena.get(h).is_some_and(|t| t.received_at < cutoff))
            .map(|(n, h)| (*n, *h))
            .collect();
        for (n, hash) in old {
            self.not_ready.remove(&n);
            arena.remove(&hash);
            dropped.push(DroppedTx {
                hash,
                from: self.from,
                reason: "expired".to_owned(),
            });
        }

        let mut prev_ready = None;
        if let Some(h) = self.ready {
            if arena.get(&h).is_some_and(|t| t.received_at < cutoff) {
                prev_ready = self.ready_key(arena);
                self.ready = None;
                arena.remove(&h);
                dropped.push(DroppedTx {
                    hash: h,
                    from: self.from,
                    reason: "expired".to_owned(),
                });
            }
        }

        (dropped, prev_ready)
    }

    pub(crate) fn add_forced_tx(&mut self, hash: TxHash) {
        self.forced.insert(hash);
    }

    pub(crate) fn delete_forced_tx(&mut self, hash: &TxHash) {
        if !self.forced.remove(hash) {
            warn!(txh = %hash, addr = %self.from, "tx not in forced set");
        }
    }

    pub(crate) fn add_pending_store(&mut self, hash: TxHash) {
        self.pending_store.insert(hash);
    }

    pub(crate) fn delete_pending_store(&mut self, hash: &TxHash) {
        if !self.pending_store.remove(hash) {
            warn!(txh = %hash, addr = %self.from, "tx not in pending-store set");
        }
    }

    /// A queue with nothing queued and nothing pinned can be dropped.
    pub(crate) fn is_empty(&self) -> bool {
        self.ready.is_none()
            && self.not_ready.is_empty()
            && self.forced.is_empty()
            && self.pending_store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use moraine_config::ResourceWeights;
    use moraine_primitives::{BatchConstraints, BatchResources};

    use super::*;
    use crate::score::WeightedScorer;

    fn scorer() -> WeightedScorer {
        WeightedScorer::new(
            BatchConstraints::default(),
            &ResourceWeights::default(),
            1.0,
        )
    }

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn tracker(hash_byte: u8, nonce: u64, cost: u64, price: u64) -> TxTracker {
        let scorer = scorer();
        let pending = moraine_db::PendingTx {
            hash: TxHash::new([hash_byte; 32]),
            from: addr(1),
            nonce,
            gas: 21_000,
            gas_price: U256::from(price),
            cost: U256::from(cost),
            raw: vec![hash_byte; 8],
            reserved_resources: BatchResources::default(),
            received_at: 1_000,
            submitter: None,
        };
        TxTracker::new(pending, &scorer)
    }

    struct Setup {
        queue: AddrQueue,
        arena: TxArena,
    }

    fn setup(nonce: u64, balance: u64) -> Setup {
        Setup {
            queue: AddrQueue::new(addr(1), nonce, U256::from(balance)),
            arena: TxArena::default(),
        }
    }

    #[test]
    fn test_matching_nonce_becomes_ready() {
        let mut s = setup(1, 10);
        let (transition, replaced) = s.queue.add_tx(&mut s.arena, tracker(1, 1, 5, 2)).unwrap();
        assert!(transition.new_ready.is_some());
        assert!(transition.prev_ready.is_none());
        assert!(replaced.is_none());
        assert_eq!(s.queue.ready_hash(), Some(TxHash::new([1; 32])));
    }

    #[test]
    fn test_cost_equal_to_balance_is_affordable() {
        let mut s = setup(0, 5);
        let (transition, _) = s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();
        assert!(transition.new_ready.is_some());
    }

    #[test]
    fn test_unaffordable_goes_not_ready() {
        let mut s = setup(0, 4);
        let (transition, _) = s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();
        assert!(transition.new_ready.is_none());
        assert!(s.queue.ready_hash().is_none());
        assert!(!s.queue.is_empty());
    }

    #[test]
    fn test_replacement_ties_favor_incoming() {
        let mut s = setup(0, 100);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 2)).unwrap();
        let (transition, replaced) = s.queue.add_tx(&mut s.arena, tracker(2, 0, 5, 2)).unwrap();

        assert_eq!(replaced, Some(TxHash::new([1; 32])));
        assert_eq!(transition.new_ready.unwrap().hash, TxHash::new([2; 32]));
        assert!(s.arena.get(&TxHash::new([1; 32])).is_none());
    }

    #[test]
    fn test_worse_price_is_dropped() {
        let mut s = setup(0, 100);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 3)).unwrap();
        let err = s
            .queue
            .add_tx(&mut s.arena, tracker(2, 0, 5, 2))
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateNonce));
        assert_eq!(s.queue.ready_hash(), Some(TxHash::new([1; 32])));
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let mut s = setup(5, 100);
        let err = s
            .queue
            .add_tx(&mut s.arena, tracker(1, 4, 5, 1))
            .unwrap_err();
        assert!(matches!(err, WorkerError::StaleNonce));
    }

    #[test]
    fn test_not_ready_replacement() {
        let mut s = setup(0, 100);
        s.queue.add_tx(&mut s.arena, tracker(1, 3, 5, 2)).unwrap();
        let (_, replaced) = s.queue.add_tx(&mut s.arena, tracker(2, 3, 5, 5)).unwrap();
        assert_eq!(replaced, Some(TxHash::new([1; 32])));

        let err = s
            .queue
            .add_tx(&mut s.arena, tracker(3, 3, 5, 4))
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateNonce));
    }

    // Nonce 1 / balance 10; submissions with nonces 2, 1, 4: only the
    // nonce-1 tx may become ready.
    #[test]
    fn test_ready_and_not_ready_split() {
        let mut s = setup(1, 10);
        s.queue.add_tx(&mut s.arena, tracker(2, 2, 5, 1)).unwrap();
        let (transition, _) = s.queue.add_tx(&mut s.arena, tracker(1, 1, 5, 2)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(4, 4, 5, 1)).unwrap();

        assert_eq!(transition.new_ready.unwrap().hash, TxHash::new([1; 32]));
        assert_eq!(s.queue.ready_hash(), Some(TxHash::new([1; 32])));
        assert_eq!(s.arena.len(), 3);
    }

    // Continuation: nonce jumps to 4, balance 15. Nonce 2 purges, nonce 4
    // promotes.
    #[test]
    fn test_nonce_advance_purges_and_promotes() {
        let mut s = setup(1, 10);
        s.queue.add_tx(&mut s.arena, tracker(2, 2, 5, 1)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(1, 1, 5, 2)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(4, 4, 5, 1)).unwrap();

        let (transition, dropped) =
            s.queue
                .update_nonce_balance(&mut s.arena, Some(4), Some(U256::from(15u64)));

        assert_eq!(transition.new_ready.unwrap().hash, TxHash::new([4; 32]));
        // The old ready tx (nonce 1) was evicted, the nonce 2 one purged.
        assert_eq!(transition.prev_ready.unwrap().hash, TxHash::new([1; 32]));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].hash, TxHash::new([2; 32]));
        assert_eq!(s.arena.len(), 1);
    }

    #[test]
    fn test_balance_drop_evicts_ready() {
        let mut s = setup(0, 10);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();

        let (transition, dropped) =
            s.queue
                .update_nonce_balance(&mut s.arena, None, Some(U256::from(2u64)));

        assert!(transition.new_ready.is_none());
        assert_eq!(transition.prev_ready.unwrap().hash, TxHash::new([1; 32]));
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_evicted_future_nonce_refiled() {
        let mut s = setup(0, 10);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(3, 1, 5, 1)).unwrap();

        // Nonce regression observed (reorg-ish): ready tx nonce 0 is now
        // ahead? No: nonce stays 0, ready is evicted by balance, then
        // balance recovers and nonce moves to 1: the nonce-1 tx promotes.
        let (transition, _) =
            s.queue
                .update_nonce_balance(&mut s.arena, Some(1), Some(U256::from(10u64)));
        assert_eq!(transition.new_ready.unwrap().hash, TxHash::new([3; 32]));
        // The nonce-0 ready tx fell below the current nonce and is gone.
        assert!(s.arena.get(&TxHash::new([1; 32])).is_none());
    }

    #[test]
    fn test_delete_ready_does_not_autopromote() {
        let mut s = setup(0, 10);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(2, 1, 5, 1)).unwrap();

        let key = s.queue.delete_tx(&mut s.arena, &TxHash::new([1; 32]));
        assert!(key.is_some());
        assert!(s.queue.ready_hash().is_none());
    }

    #[test]
    fn test_expire() {
        let mut s = setup(0, 10);
        s.queue.add_tx(&mut s.arena, tracker(1, 0, 5, 1)).unwrap();
        s.queue.add_tx(&mut s.arena, tracker(2, 1, 5, 1)).unwrap();

        // received_at is 1_000 in the fixture; cutoff after it expires both.
        let (dropped, prev_ready) = s.queue.expire(&mut s.arena, 2_000);
        assert_eq!(dropped.len(), 2);
        assert_eq!(prev_ready.unwrap().hash, TxHash::new([1; 32]));
        assert!(s.queue.is_empty());
        assert_eq!(s.arena.len(), 0);
    }
}
