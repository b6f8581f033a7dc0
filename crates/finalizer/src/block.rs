//! Work-in-progress sub-block.

use moraine_engine::SubmittedTx;
use moraine_primitives::{BatchResources, ExitRoot};
use moraine_worker::TxTracker;

/// A sub-block being filled by the control loop.
///
/// Owns its admitted transactions until the pipeline takes over; the
/// engine's response only exists once the process stage has run it.
#[derive(Debug, Clone)]
pub struct WipBlock {
    /// Finalizer-local sequence number, for log correlation.
    pub tracking_num: u64,
    pub batch_number: u64,

    /// Timestamp limit of the block.
    pub timestamp: u64,

    /// Seconds since the previous block.
    pub delta_timestamp: u32,

    /// Exit root this block incorporates; set only on the first block of a
    /// batch that carries one.
    pub exit_root: Option<ExitRoot>,

    /// Admitted transactions in execution order.
    pub txs: Vec<SubmittedTx>,

    /// Immediate-view resources consumed, block overhead included.
    pub used: BatchResources,

    /// Wall-clock second the block was opened, for the cadence check.
    pub opened_at: u64,
}

impl WipBlock {
    pub fn new(
        tracking_num: u64,
        batch_number: u64,
        prev_timestamp: u64,
        now: u64,
        exit_root: Option<ExitRoot>,
    ) -> Self {
        let delta_timestamp = now.saturating_sub(prev_timestamp) as u32;
        Self {
            tracking_num,
            batch_number,
            timestamp: prev_timestamp + u64::from(delta_timestamp),
            delta_timestamp,
            exit_root,
            txs: Vec::new(),
            used: BatchResources::default(),
            opened_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn add_tx(&mut self, tracker: &TxTracker) {
        self.txs.push(SubmittedTx {
            hash: tracker.hash,
            from: tracker.from,
            raw: tracker.raw.clone(),
        });
    }

    /// Whether the block has been open past the target cadence.
    pub fn past_deadline(&self, period_secs: u64, now: u64) -> bool {
        now >= self.opened_at + period_secs
    }
}
