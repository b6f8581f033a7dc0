//! Batch and sub-block lifecycle.
//!
//! The finalizer pulls the best fitting ready transaction from the worker,
//! accounts it against the open batch, and drives sub-blocks through the
//! two-stage execute/store pipeline. Batches close on resource pressure or
//! on external triggers (forced batches, exit-root updates, L1 silence,
//! administrative stops), never skipping sub-block closure on the way.

mod batch;
mod block;
mod errors;
mod finalizer;
mod handle;
mod pipeline;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use batch::WipBatch;
pub use block::WipBlock;
pub use errors::{FinalizerError, FinalizerResult};
pub use finalizer::Finalizer;
pub use handle::{FinalizerHandle, FinalizerStatus};
pub use pipeline::FlushMonitor;
