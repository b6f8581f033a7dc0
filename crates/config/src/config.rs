use std::path::Path;

use moraine_primitives::{Address, BatchConstraints};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default pause between selection attempts when no transaction is ready.
const DEFAULT_NEW_TX_WAIT_MS: u64 = 100;

/// Default remaining-resource percentage under which a batch closes.
const DEFAULT_RESOURCE_PERCENTAGE_TO_CLOSE: u8 = 10;

/// Default deadline after the first buffered forced batch, in seconds.
const DEFAULT_FORCED_BATCH_DEADLINE_SECS: u64 = 60;

/// Default deadline after a pending exit-root update, in seconds.
const DEFAULT_EXIT_ROOT_DEADLINE_SECS: u64 = 60;

/// Default max age of an open batch, in seconds.
const DEFAULT_TIMESTAMP_RESOLUTION_SECS: u64 = 10;

/// Default cadence for closing sub-blocks, in seconds.
const DEFAULT_BLOCK_PERIOD_SECS: u64 = 3;

/// Default bound of both pipeline hand-off queues.
const DEFAULT_PIPELINE_BUFFER_SIZE: usize = 64;

/// Default interval for polling the durable flush id, in ms.
const DEFAULT_FLUSH_ID_POLL_MS: u64 = 500;

/// Default candidate age limit before expiry, in seconds.
const DEFAULT_TX_LIFETIME_SECS: u64 = 3 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level sequencer configuration.
///
/// Loaded once at startup and swapped as a whole on reload; see
/// [`crate::ConfigHandle`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Address credited with sequencing fees, stamped on every batch.
    #[serde(default)]
    pub coinbase: Address,

    /// Per-batch proving-circuit capacity.
    #[serde(default)]
    pub constraints: BatchConstraints,

    #[serde(default)]
    pub finalizer: FinalizerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pollers: PollerConfig,
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizerConfig {
    /// Pause between selection attempts when no ready transaction fits.
    #[serde(default = "default_new_tx_wait_ms")]
    pub new_tx_wait_ms: u64,

    /// A batch closes once any remaining resource drops to this percentage
    /// of its constraint.
    #[serde(default = "default_resource_percentage_to_close")]
    pub resource_percentage_to_close: u8,

    /// How long after the first buffered forced batch the current batch
    /// must close.
    #[serde(default = "default_forced_batch_deadline_secs")]
    pub forced_batch_deadline_secs: u64,

    /// How long after a pending exit-root update the current batch must
    /// close.
    #[serde(default = "default_exit_root_deadline_secs")]
    pub exit_root_deadline_secs: u64,

    /// Max age of a non-empty open batch.
    #[serde(default = "default_timestamp_resolution_secs")]
    pub timestamp_resolution_secs: u64,

    /// Target cadence for closing sub-blocks.
    #[serde(default = "default_block_period_secs")]
    pub block_period_secs: u64,

    /// Bound of the to-process and to-store queues.
    #[serde(default = "default_pipeline_buffer_size")]
    pub pipeline_buffer_size: usize,

    /// Interval for polling the store's durable flush id.
    #[serde(default = "default_flush_id_poll_ms")]
    pub flush_id_poll_ms: u64,

    /// Halt after closing this batch number, if set.
    #[serde(default)]
    pub stop_on_batch: Option<u64>,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults must deserialize")
    }
}

/// Relative weights for the efficiency score, one per resource dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceWeights {
    pub cumulative_gas_used: u32,
    pub keccak_hashes: u32,
    pub poseidon_hashes: u32,
    pub poseidon_paddings: u32,
    pub mem_aligns: u32,
    pub arithmetics: u32,
    pub binaries: u32,
    pub steps: u32,
    pub bytes: u32,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self {
            cumulative_gas_used: 1,
            keccak_hashes: 1,
            poseidon_hashes: 1,
            poseidon_paddings: 1,
            mem_aligns: 1,
            arithmetics: 1,
            binaries: 1,
            steps: 1,
            bytes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Scale factor applied to the weighted resource cost in the score.
    #[serde(default = "default_resource_cost_multiplier")]
    pub resource_cost_multiplier: f64,

    /// Score weights.
    #[serde(default)]
    pub weights: ResourceWeights,

    /// Age after which an unselected candidate is expired, 0 disables.
    #[serde(default = "default_tx_lifetime_secs")]
    pub tx_lifetime_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults must deserialize")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Interval between forced-batch checks, in ms.
    #[serde(default = "default_forced_poll_ms")]
    pub forced_batch_check_interval_ms: u64,

    /// L1 confirmation depth a forced batch needs before delivery.
    #[serde(default = "default_forced_l1_confirmations")]
    pub forced_batch_l1_confirmations: u64,

    /// Interval between exit-root checks, in ms.
    #[serde(default = "default_exit_root_poll_ms")]
    pub exit_root_check_interval_ms: u64,

    /// L1 confirmation depth an exit-root update needs before delivery.
    #[serde(default = "default_exit_root_l1_confirmations")]
    pub exit_root_l1_confirmations: u64,

    /// Max time since the last virtualized batch before a timeout signal
    /// fires, in seconds.
    #[serde(default = "default_l1_silence_bound_secs")]
    pub l1_silence_bound_secs: u64,

    /// Floor for the silence poller's adaptive sleep, in ms.
    #[serde(default = "default_l1_silence_min_poll_ms")]
    pub l1_silence_min_poll_ms: u64,

    /// Interval between pool intake sweeps, in ms.
    #[serde(default = "default_pool_intake_interval_ms")]
    pub pool_intake_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults must deserialize")
    }
}

fn default_new_tx_wait_ms() -> u64 {
    DEFAULT_NEW_TX_WAIT_MS
}

fn default_resource_percentage_to_close() -> u8 {
    DEFAULT_RESOURCE_PERCENTAGE_TO_CLOSE
}

fn default_forced_batch_deadline_secs() -> u64 {
    DEFAULT_FORCED_BATCH_DEADLINE_SECS
}

fn default_exit_root_deadline_secs() -> u64 {
    DEFAULT_EXIT_ROOT_DEADLINE_SECS
}

fn default_timestamp_resolution_secs() -> u64 {
    DEFAULT_TIMESTAMP_RESOLUTION_SECS
}

fn default_block_period_secs() -> u64 {
    DEFAULT_BLOCK_PERIOD_SECS
}

fn default_pipeline_buffer_size() -> usize {
    DEFAULT_PIPELINE_BUFFER_SIZE
}

fn default_flush_id_poll_ms() -> u64 {
    DEFAULT_FLUSH_ID_POLL_MS
}

fn default_resource_cost_multiplier() -> f64 {
    1.0
}

fn default_tx_lifetime_secs() -> u64 {
    DEFAULT_TX_LIFETIME_SECS
}

fn default_forced_poll_ms() -> u64 {
    10_000
}

fn default_forced_l1_confirmations() -> u64 {
    64
}

fn default_exit_root_poll_ms() -> u64 {
    10_000
}

fn default_exit_root_l1_confirmations() -> u64 {
    64
}

fn default_l1_silence_bound_secs() -> u64 {
    300
}

fn default_l1_silence_min_poll_ms() -> u64 {
    1_000
}

fn default_pool_intake_interval_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.finalizer.new_tx_wait_ms, DEFAULT_NEW_TX_WAIT_MS);
        assert_eq!(config.worker.weights.bytes, 2);
        assert_eq!(config.pollers.l1_silence_bound_secs, 300);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"
            [finalizer]
            resource_percentage_to_close = 15

            [worker.weights]
            cumulative_gas_used = 4
            keccak_hashes = 1
            poseidon_hashes = 1
            poseidon_paddings = 1
            mem_aligns = 1
            arithmetics = 1
            binaries = 1
            steps = 3
            bytes = 5
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.finalizer.resource_percentage_to_close, 15);
        assert_eq!(config.finalizer.new_tx_wait_ms, DEFAULT_NEW_TX_WAIT_MS);
        assert_eq!(config.worker.weights.steps, 3);
    }
}
