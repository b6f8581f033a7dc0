//! Transaction admission and selection.
//!
//! The worker is the single authority over which candidate transactions
//! are ready (nonce matches, cost affordable) and which ready transaction
//! a batch should take next. Trackers live in one arena keyed by hash;
//! per-sender queues and the global efficiency index only hold keys into
//! it, so a tracker can never be "ready" in two places.

mod addr_queue;
mod arena;
mod errors;
mod list;
mod score;
mod tracker;
mod worker;

pub use errors::{WorkerError, WorkerResult};
pub use list::{EfficiencyKey, EfficiencyList};
pub use score::{EfficiencyScorer, WeightedScorer};
pub use tracker::TxTracker;
pub use worker::{DroppedTx, Worker};
