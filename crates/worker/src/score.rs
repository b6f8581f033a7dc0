//! Efficiency scoring policy.
//!
//! The ordering contract (higher score first, hash tiebreak) is structural;
//! the formula itself is policy and pluggable.

use ethnum::U256;
use moraine_config::ResourceWeights;
use moraine_primitives::{BatchConstraints, BatchResources};

/// Ranks a transaction's value against its resource footprint.
pub trait EfficiencyScorer: Send + Sync + 'static {
    /// Higher is preferred. Must never return NaN.
    fn score(&self, benefit: U256, footprint: &BatchResources) -> f64;
}

/// Benefit over weighted, constraint-normalized resource cost.
///
/// Each dimension contributes `(used / max) * weight / total_weight`; the
/// sum is scaled by a global multiplier and divided into the benefit.
#[derive(Debug, Clone)]
pub struct WeightedScorer {
    constraints: BatchConstraints,
    multipliers: [f64; 9],
    cost_multiplier: f64,
}

impl WeightedScorer {
    pub fn new(
        constraints: BatchConstraints,
        weights: &ResourceWeights,
        cost_multiplier: f64,
    ) -> Self {
        let raw = [
            weights.cumulative_gas_used,
            weights.keccak_hashes,
            weights.poseidon_hashes,
            weights.poseidon_paddings,
            weights.mem_aligns,
            weights.arithmetics,
            weights.binaries,
            weights.steps,
            weights.bytes,
        ];
        let total: u32 = raw.iter().sum();
        let total = f64::from(total.max(1));
        let multipliers = raw.map(|w| f64::from(w) / total);

        Self {
            constraints,
            multipliers,
            cost_multiplier,
        }
    }

    fn resource_cost(&self, footprint: &BatchResources) -> f64 {
        let c = &self.constraints;
        let z = &footprint.zk_counters;
        let parts = [
            (z.cumulative_gas_used, c.max_cumulative_gas_used),
            (z.keccak_hashes, c.max_keccak_hashes),
            (z.poseidon_hashes, c.max_poseidon_hashes),
            (z.poseidon_paddings, c.max_poseidon_paddings),
            (z.mem_aligns, c.max_mem_aligns),
            (z.arithmetics, c.max_arithmetics),
            (z.binaries, c.max_binaries),
            (z.steps, c.max_steps),
            (footprint.bytes, c.max_bytes),
        ];

        let cost: f64 = parts
            .iter()
            .zip(self.multipliers)
            .map(|((used, max), mult)| (*used as f64 / (*max).max(1) as f64) * mult)
            .sum();

        cost * self.cost_multiplier
    }
}

impl EfficiencyScorer for WeightedScorer {
    fn score(&self, benefit: U256, footprint: &BatchResources) -> f64 {
        let cost = self.resource_cost(footprint);
        if cost <= 0.0 {
            // A zero-footprint candidate beats everything.
            return f64::MAX;
        }
        u256_to_f64(benefit) / cost
    }
}

fn u256_to_f64(v: U256) -> f64 {
    let (hi, lo) = v.into_words();
    hi as f64 * 2f64.powi(128) + lo as f64
}

#[cfg(test)]
mod tests {
    use moraine_primitives::ZkCounters;

    use super::*;

    fn scorer() -> WeightedScorer {
        WeightedScorer::new(
            BatchConstraints::default(),
            &ResourceWeights::default(),
            1.0,
        )
    }

    fn footprint(steps: u64, bytes: u64) -> BatchResources {
        BatchResources::new(
            ZkCounters {
                steps,
                ..Default::default()
            },
            bytes,
        )
    }

    #[test]
    fn test_higher_benefit_scores_higher() {
        let s = scorer();
        let fp = footprint(100, 100);
        assert!(s.score(U256::from(2_000u64), &fp) > s.score(U256::from(1_000u64), &fp));
    }

    #[test]
    fn test_heavier_footprint_scores_lower() {
        let s = scorer();
        let benefit = U256::from(1_000u64);
        assert!(s.score(benefit, &footprint(100, 100)) > s.score(benefit, &footprint(1_000, 100)));
    }

    #[test]
    fn test_zero_footprint_maxes_out() {
        let s = scorer();
        assert_eq!(s.score(U256::ONE, &footprint(0, 0)), f64::MAX);
    }

    #[test]
    fn test_never_nan() {
        let s = scorer();
        assert!(!s.score(U256::ZERO, &footprint(0, 0)).is_nan());
        assert!(!s.score(U256::ZERO, &footprint(1, 1)).is_nan());
        assert!(!s.score(U256::MAX, &footprint(1, 0)).is_nan());
    }
}
