//! The engine capability set.

use async_trait::async_trait;

use crate::{
    errors::EngineResult,
    types::{BlockExecOutput, BlockExecRequest},
};

/// Capability set of the remote execution engine.
///
/// Implementations wrap a concrete transport (gRPC in production, an
/// in-process simulator in tests); the sequencer core is generic over this
/// trait and never constructs one itself.
#[async_trait]
pub trait ExecEngine: Send + Sync + 'static {
    /// Executes a block payload on top of `prior_state_root` and reports
    /// the outcome. The call is read-only from the sequencer's point of
    /// view until the returned flush id is confirmed durable.
    async fn execute_block(&self, req: BlockExecRequest) -> EngineResult<BlockExecOutput>;

    /// Identity of the running engine instance. Changes when the engine
    /// restarts, which invalidates any unconfirmed flush ids.
    async fn instance_id(&self) -> EngineResult<String>;
}
