//! Shared leaf types for the moraine sequencer stack.

mod buf;
mod closing;
mod resources;

pub use buf::{Address, Buf20, Buf32, ExitRoot, StateRoot, TxHash};
pub use closing::ClosingReason;
pub use resources::{
    BatchConstraints, BatchResources, ResourceName, ResourceOverflow, ZkCounters,
};
