//! Sequencer orchestration.
//!
//! Wires the worker, the closing-signal pollers, the finalizer and the
//! pool intake loop onto a task executor. The embedding node supplies the
//! engine, store, state and pool implementations.

mod builder;
mod intake;

pub use builder::{SequencerBuilder, SequencerHandle};
