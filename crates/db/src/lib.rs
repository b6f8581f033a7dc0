//! Persistence and pool boundaries of the sequencer core.
//!
//! The authoritative state lives behind a remote store; these traits are
//! the exact capability set the core consumes. Implementations must make
//! each mutating operation atomic (the original store wraps each in its own
//! database transaction).

mod errors;
mod traits;
mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use errors::{DbError, DbResult};
pub use traits::{SequencerDb, StateReader, TxPool};
pub use types::{
    BatchReceipt, ExitRootUpdate, ForcedBatch, OpenBatchParams, PendingTx, StoredBlock, TxStatus,
    WipBatchRecord,
};
