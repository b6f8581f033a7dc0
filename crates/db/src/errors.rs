//! Database errors.

use moraine_primitives::TxHash;
use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error, Clone)]
pub enum DbError {
    #[error("missing batch {0}")]
    MissingBatch(u64),

    #[error("missing forced batch {0}")]
    MissingForcedBatch(u64),

    #[error("missing pool entry {0}")]
    MissingPoolTx(TxHash),

    #[error("batch {0} already open")]
    BatchAlreadyOpen(u64),

    #[error("batch {0} not open")]
    BatchNotOpen(u64),

    /// Transient failure talking to the store; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl DbError {
    /// Whether the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
