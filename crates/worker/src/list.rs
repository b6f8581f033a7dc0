//! Global efficiency-ordered index of ready transactions.

use std::collections::HashSet;

use moraine_primitives::TxHash;
use parking_lot::Mutex;

/// Sort key of one ready transaction.
///
/// Ordered so that ascending position means descending efficiency, with a
/// descending-hash tiebreak for determinism. Scores are never NaN (the
/// scorer guarantees it), so `total_cmp` is a strict total order.
#[derive(Debug, Clone, Copy)]
pub struct EfficiencyKey {
    pub score: f64,
    pub hash: TxHash,
}

impl PartialEq for EfficiencyKey {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score).is_eq() && self.hash == other.hash
    }
}

impl Eq for EfficiencyKey {}

impl PartialOrd for EfficiencyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EfficiencyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

/// Concurrency-safe sorted index over all currently ready transactions,
/// one entry per hash.
///
/// Mutations come only from ready/not-ready transitions in the per-sender
/// queues; the worker performs both sides of a transition under its own
/// lock so the index and the queues can't drift apart.
#[derive(Debug, Default)]
pub struct EfficiencyList {
    inner: Mutex<ListInner>,
}

#[derive(Debug, Default)]
struct ListInner {
    sorted: Vec<EfficiencyKey>,
    hashes: HashSet<TxHash>,
}

impl EfficiencyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key at its sorted position. Returns false if the hash is
    /// already present.
    pub fn add(&self, key: EfficiencyKey) -> bool {
        let mut inner = self.inner.lock();
        if !inner.hashes.insert(key.hash) {
            return false;
        }
        let pos = inner.sorted.binary_search(&key).unwrap_or_else(|p| p);
        inner.sorted.insert(pos, key);
        true
    }

    /// Removes a key. Returns false if the hash wasn't present.
    pub fn delete(&self, key: &EfficiencyKey) -> bool {
        let mut inner = self.inner.lock();
        if !inner.hashes.remove(&key.hash) {
            return false;
        }
        match inner.sorted.binary_search(key) {
            Ok(pos) => {
                inner.sorted.remove(pos);
            }
            Err(_) => {
                // Key drifted from the stored score; fall back to a scan.
                // Reachable only if a caller rescored without reindexing.
                let pos = inner
                    .sorted
                    .iter()
                    .position(|k| k.hash == key.hash)
                    .expect("list: hash tracked but key missing");
                inner.sorted.remove(pos);
            }
        }
        true
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.lock().hashes.contains(hash)
    }

    pub fn get_by_index(&self, i: usize) -> Option<EfficiencyKey> {
        self.inner.lock().sorted.get(i).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sorted.is_empty()
    }

    /// Point-in-time snapshot in efficiency order. Not stable under
    /// concurrent mutation.
    pub fn snapshot(&self) -> Vec<EfficiencyKey> {
        self.inner.lock().sorted.clone()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(score: f64, byte: u8) -> EfficiencyKey {
        EfficiencyKey {
            score,
            hash: TxHash::new([byte; 32]),
        }
    }

    #[test]
    fn test_sorted_descending() {
        let list = EfficiencyList::new();
        assert!(list.add(key(1.0, 1)));
        assert!(list.add(key(3.0, 2)));
        assert!(list.add(key(2.0, 3)));

        let scores: Vec<f64> = list.snapshot().iter().map(|k| k.score).collect();
        assert_eq!(scores, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_dedup_by_hash() {
        let list = EfficiencyList::new();
        assert!(list.add(key(1.0, 1)));
        assert!(!list.add(key(2.0, 1)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_tie_breaks_by_descending_hash() {
        let list = EfficiencyList::new();
        list.add(key(1.0, 1));
        list.add(key(1.0, 9));

        let hashes: Vec<TxHash> = list.snapshot().iter().map(|k| k.hash).collect();
        assert_eq!(hashes, vec![TxHash::new([9; 32]), TxHash::new([1; 32])]);
    }

    #[test]
    fn test_delete() {
        let list = EfficiencyList::new();
        let k = key(5.0, 7);
        list.add(k);
        assert!(list.delete(&k));
        assert!(!list.delete(&k));
        assert!(list.is_empty());
    }

    #[test]
    fn test_get_by_index() {
        let list = EfficiencyList::new();
        list.add(key(1.0, 1));
        list.add(key(2.0, 2));
        assert_eq!(list.get_by_index(0).unwrap().score, 2.0);
        assert_eq!(list.get_by_index(1).unwrap().score, 1.0);
        assert!(list.get_by_index(2).is_none());
    }

    proptest! {
        #[test]
        fn test_random_inserts_stay_sorted(scores in prop::collection::vec(0u32..1_000_000, 1..64)) {
            let list = EfficiencyList::new();
            for (i, s) in scores.iter().enumerate() {
                let mut hash = [0u8; 32];
                hash[0] = (i % 256) as u8;
                hash[1] = (i / 256) as u8;
                list.add(EfficiencyKey { score: f64::from(*s), hash: TxHash::new(hash) });
            }

            let snapshot = list.snapshot();
            for pair in snapshot.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score == pair[1].score {
                    prop_assert!(pair[0].hash > pair[1].hash);
                }
            }
        }
    }
}
