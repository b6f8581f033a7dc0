//! Finalizer errors.
//!
//! Everything here except [`FinalizerError::Interrupted`] is fatal: the
//! finalizer prefers halting over continuing into a batch the prover could
//! reject.

use moraine_db::DbError;
use moraine_engine::EngineError;
use moraine_primitives::ResourceOverflow;
use thiserror::Error;

pub type FinalizerResult<T> = Result<T, FinalizerError>;

#[derive(Debug, Error)]
pub enum FinalizerError {
    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("store: {0}")]
    Db(#[from] DbError),

    /// The engine's response doesn't line up with what was submitted
    /// (count, order, hashes or timestamp).
    #[error("engine response mismatch: {0}")]
    ResponseMismatch(String),

    /// Accounting that the selection pre-check should have made
    /// impossible; the engine and the worker disagree about costs.
    #[error("batch accounting overflow: {0}")]
    Accounting(#[from] ResourceOverflow),

    /// The engine restarted while flush ids were outstanding.
    #[error("engine instance changed from {0} to {1}")]
    EngineRestarted(String, String),

    /// The synchronizer observed a diverging trusted state. The WIP batch
    /// is discarded and processing must restart from a re-sync.
    #[error("L2 reorg detected: local root {local}, observed {observed}")]
    ReorgDetected {
        local: moraine_primitives::StateRoot,
        observed: moraine_primitives::StateRoot,
    },

    /// Shutdown arrived during a blocking wait. Not a failure.
    #[error("interrupted by shutdown")]
    Interrupted,
}

impl FinalizerError {
    /// True for the cooperative-shutdown pseudo-error.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
