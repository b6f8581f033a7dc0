//! Worker errors.

use moraine_db::DbError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The candidate's own footprint exceeds the batch constraints, it can
    /// never be selected.
    #[error("candidate exceeds batch constraints")]
    OutOfCounters,

    /// A same-nonce transaction with a better price is already queued.
    #[error("duplicate nonce with lower price")]
    DuplicateNonce,

    /// The candidate's nonce is below the sender's current nonce.
    #[error("nonce already consumed")]
    StaleNonce,

    /// There are no ready transactions at all.
    #[error("no ready transactions")]
    NoReadyTxs,

    /// There are ready transactions but none fits the remaining budget.
    #[error("no ready transaction fits the remaining resources")]
    NoFittingTx,

    #[error("state read failed: {0}")]
    Db(#[from] DbError),
}
