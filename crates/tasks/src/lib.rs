//! Task management: spawning, tracking and cooperative shutdown.
//!
//! Critical tasks are the ones whose failure means the process can no
//! longer make progress: the first critical task that returns an error or
//! panics triggers the shutdown signal, and every other task is expected
//! to observe it at its next blocking point.

mod manager;
mod shutdown;

pub use manager::{TaskExecutor, TaskManager};
pub use shutdown::{ShutdownGuard, ShutdownSignal};
