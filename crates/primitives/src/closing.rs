//! Batch closing reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a batch was (or is about to be) closed.
///
/// Recorded in the batch receipt so the prover pipeline can distinguish
/// organic closes from externally triggered ones.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClosingReason {
    /// Batch is still open.
    #[default]
    StillOpen,
    /// Reached the max transaction count.
    Full,
    /// A resource dimension dropped under the close threshold.
    AlmostFull,
    /// A block's reserved resources no longer fit in the batch.
    ResourceExhausted,
    /// The pending exit-root update deadline elapsed.
    ExitRootDeadline,
    /// The pending forced-batch deadline elapsed.
    ForcedBatchDeadline,
    /// The batch timestamp aged past the resolution bound.
    TimestampDeadline,
    /// L1 went silent; closed to give the sender something to virtualize.
    L1Timeout,
    /// The batch itself is a forced batch.
    ForcedBatch,
    /// An administrative stop was requested.
    AdminStop,
}

impl fmt::Display for ClosingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StillOpen => "still_open",
            Self::Full => "full",
            Self::AlmostFull => "almost_full",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ExitRootDeadline => "exit_root_deadline",
            Self::ForcedBatchDeadline => "forced_batch_deadline",
            Self::TimestampDeadline => "timestamp_deadline",
            Self::L1Timeout => "l1_timeout",
            Self::ForcedBatch => "forced_batch",
            Self::AdminStop => "admin_stop",
        };
        f.write_str(s)
    }
}
