//! Multi-dimensional batch resource accounting.
//!
//! A batch has a fixed budget for every proving-circuit counter plus the
//! encoded byte size. The budget only ever decreases via [`BatchResources::checked_sub`],
//! which either applies fully or not at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one constrained resource dimension.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ResourceName {
    Bytes,
    CumulativeGasUsed,
    KeccakHashes,
    PoseidonHashes,
    PoseidonPaddings,
    MemAligns,
    Arithmetics,
    Binaries,
    Steps,
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bytes => "bytes",
            Self::CumulativeGasUsed => "cumulative_gas_used",
            Self::KeccakHashes => "keccak_hashes",
            Self::PoseidonHashes => "poseidon_hashes",
            Self::PoseidonPaddings => "poseidon_paddings",
            Self::MemAligns => "mem_aligns",
            Self::Arithmetics => "arithmetics",
            Self::Binaries => "binaries",
            Self::Steps => "steps",
        };
        f.write_str(s)
    }
}

/// Returned when a subtraction would drive a resource below zero.
///
/// Carries the first offending dimension; the target is left untouched.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("resource underflow on {0}")]
pub struct ResourceOverflow(pub ResourceName);

/// Proving-circuit counters consumed by a transaction or block.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ZkCounters {
    pub cumulative_gas_used: u64,
    pub keccak_hashes: u64,
    pub poseidon_hashes: u64,
    pub poseidon_paddings: u64,
    pub mem_aligns: u64,
    pub arithmetics: u64,
    pub binaries: u64,
    pub steps: u64,
}

impl ZkCounters {
    /// Iterates the counter fields in a fixed order, paired with their names.
    fn fields(&self) -> [(ResourceName, u64); 8] {
        [
            (ResourceName::CumulativeGasUsed, self.cumulative_gas_used),
            (ResourceName::KeccakHashes, self.keccak_hashes),
            (ResourceName::PoseidonHashes, self.poseidon_hashes),
            (ResourceName::PoseidonPaddings, self.poseidon_paddings),
            (ResourceName::MemAligns, self.mem_aligns),
            (ResourceName::Arithmetics, self.arithmetics),
            (ResourceName::Binaries, self.binaries),
            (ResourceName::Steps, self.steps),
        ]
    }
}

/// The full resource footprint of a transaction, block or batch: circuit
/// counters plus encoded byte size.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchResources {
    pub zk_counters: ZkCounters,
    pub bytes: u64,
}

impl BatchResources {
    pub fn new(zk_counters: ZkCounters, bytes: u64) -> Self {
        Self { zk_counters, bytes }
    }

    /// Checks whether `other` fits inside `self` without modifying anything.
    pub fn fits(&self, other: &Self) -> Result<(), ResourceOverflow> {
        self.checked_sub_inner(other).map(|_| ())
    }

    /// Subtracts `other` field-wise. On any underflow nothing is modified
    /// and the first offending field is reported.
    pub fn checked_sub(&mut self, other: &Self) -> Result<(), ResourceOverflow> {
        *self = self.checked_sub_inner(other)?;
        Ok(())
    }

    /// Field-wise accumulate, used to rebuild a running used-resources total.
    pub fn sum_up(&mut self, other: &Self) {
        let c = &mut self.zk_counters;
        let o = &other.zk_counters;
        c.cumulative_gas_used += o.cumulative_gas_used;
        c.keccak_hashes += o.keccak_hashes;
        c.poseidon_hashes += o.poseidon_hashes;
        c.poseidon_paddings += o.poseidon_paddings;
        c.mem_aligns += o.mem_aligns;
        c.arithmetics += o.arithmetics;
        c.binaries += o.binaries;
        c.steps += o.steps;
        self.bytes += other.bytes;
    }

    fn checked_sub_inner(&self, other: &Self) -> Result<Self, ResourceOverflow> {
        let bytes = self
            .bytes
            .checked_sub(other.bytes)
            .ok_or(ResourceOverflow(ResourceName::Bytes))?;

        let mut fields = self.zk_counters.fields();
        for ((name, value), (_, used)) in fields.iter_mut().zip(other.zk_counters.fields()) {
            *value = value.checked_sub(used).ok_or(ResourceOverflow(*name))?;
        }
        let [gas, keccak, poseidon, paddings, mem, arith, bin, steps] =
            fields.map(|(_, value)| value);

        Ok(Self {
            zk_counters: ZkCounters {
                cumulative_gas_used: gas,
                keccak_hashes: keccak,
                poseidon_hashes: poseidon,
                poseidon_paddings: paddings,
                mem_aligns: mem,
                arithmetics: arith,
                binaries: bin,
                steps,
            },
            bytes,
        })
    }
}

/// The fixed per-batch capacity of the proving circuit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BatchConstraints {
    pub max_txs_per_batch: u64,
    pub max_bytes: u64,
    pub max_cumulative_gas_used: u64,
    pub max_keccak_hashes: u64,
    pub max_poseidon_hashes: u64,
    pub max_poseidon_paddings: u64,
    pub max_mem_aligns: u64,
    pub max_arithmetics: u64,
    pub max_binaries: u64,
    pub max_steps: u64,
}

impl Default for BatchConstraints {
    fn default() -> Self {
        Self {
            max_txs_per_batch: 300,
            max_bytes: 120_000,
            max_cumulative_gas_used: 30_000_000,
            max_keccak_hashes: 2_145,
            max_poseidon_hashes: 252_357,
            max_poseidon_paddings: 135_191,
            max_mem_aligns: 236_585,
            max_arithmetics: 236_585,
            max_binaries: 473_170,
            max_steps: 7_570_538,
        }
    }
}

impl BatchConstraints {
    /// The full budget of a freshly opened batch.
    pub fn as_resources(&self) -> BatchResources {
        BatchResources {
            zk_counters: ZkCounters {
                cumulative_gas_used: self.max_cumulative_gas_used,
                keccak_hashes: self.max_keccak_hashes,
                poseidon_hashes: self.max_poseidon_hashes,
                poseidon_paddings: self.max_poseidon_paddings,
                mem_aligns: self.max_mem_aligns,
                arithmetics: self.max_arithmetics,
                binaries: self.max_binaries,
                steps: self.max_steps,
            },
            bytes: self.max_bytes,
        }
    }

    /// Whether a single footprint could ever fit in an empty batch.
    pub fn accepts(&self, footprint: &BatchResources) -> bool {
        self.as_resources().fits(footprint).is_ok()
    }

    /// Resources consumed so far, reconstructed from the remaining budget.
    pub fn used(&self, remaining: &BatchResources) -> BatchResources {
        let mut used = self.as_resources();
        used.checked_sub(remaining)
            .expect("remaining resources exceed constraints");
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(bytes: u64, steps: u64) -> BatchResources {
        BatchResources {
            zk_counters: ZkCounters {
                steps,
                ..Default::default()
            },
            bytes,
        }
    }

    #[test]
    fn test_checked_sub_ok() {
        let mut budget = res(100, 50);
        budget.checked_sub(&res(40, 20)).unwrap();
        assert_eq!(budget, res(60, 30));
    }

    #[test]
    fn test_checked_sub_is_atomic() {
        // Only the last checked field (steps) underflows; nothing may change.
        let mut budget = res(100, 10);
        let before = budget;
        let err = budget.checked_sub(&res(40, 20)).unwrap_err();
        assert_eq!(err, ResourceOverflow(ResourceName::Steps));
        assert_eq!(budget, before);
    }

    #[test]
    fn test_reports_first_offending_field() {
        let mut budget = res(10, 10);
        let err = budget.checked_sub(&res(20, 20)).unwrap_err();
        assert_eq!(err, ResourceOverflow(ResourceName::Bytes));
    }

    #[test]
    fn test_fits_does_not_mutate() {
        let budget = res(100, 50);
        assert!(budget.fits(&res(100, 50)).is_ok());
        assert!(budget.fits(&res(101, 0)).is_err());
        assert_eq!(budget, res(100, 50));
    }

    #[test]
    fn test_sum_up() {
        let mut total = res(10, 5);
        total.sum_up(&res(3, 7));
        assert_eq!(total, res(13, 12));
    }

    #[test]
    fn test_constraints_used_roundtrip() {
        let constraints = BatchConstraints::default();
        let mut remaining = constraints.as_resources();
        let spent = res(1_000, 2_000);
        remaining.checked_sub(&spent).unwrap();
        assert_eq!(constraints.used(&remaining), spent);
    }

    #[test]
    fn test_constraints_accepts() {
        let constraints = BatchConstraints::default();
        assert!(constraints.accepts(&res(120_000, 0)));
        assert!(!constraints.accepts(&res(120_001, 0)));
    }
}
