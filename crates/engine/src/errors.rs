//! Engine error taxonomy.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the execution engine boundary.
///
/// Only [`EngineError::Unavailable`] is retryable; everything else means
/// the engine and the sequencer disagree about the world and continuing
/// would risk an unprovable batch.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient transport/availability failure. Retry with backoff.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The call as a whole blew a circuit counter. The per-transaction
    /// pre-check makes this unreachable for selected transactions, so
    /// hitting it means the accounting models disagree.
    #[error("engine reported out-of-counters at block level")]
    OutOfCounters,

    /// Engine-level logic error. Never retried.
    #[error("engine fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the call may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
