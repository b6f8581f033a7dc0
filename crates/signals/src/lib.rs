//! Closing-signal pollers.
//!
//! Three background pollers watch the store-backed L1 view and deliver
//! closing triggers to the finalizer: newly confirmed forced batches,
//! exit-root updates, and L1-silence timeouts. Each poller owns its
//! delivery channel so a slow consumer on one never stalls the others.

mod manager;
mod types;

pub use manager::ClosingSignalsManager;
pub use types::{ClosingSignalChannels, L1SilenceTimeout, L2ReorgSignal, ReorgNotifier};
