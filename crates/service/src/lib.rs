//! Generic service worker framework.
//!
//! A service is a single-owner state machine fed from an input source.
//! The framework owns the worker loop, status publication and launch
//! plumbing so service impls only define per-input logic.

mod adapters;
mod async_worker;
mod builder;
mod command;
mod errors;
mod status;
mod sync_worker;
mod types;

pub use adapters::{IterInput, TokioMpscInput};
pub use builder::ServiceBuilder;
pub use command::CommandHandle;
pub use errors::ServiceError;
pub use status::{ServiceMonitor, StatusMonitor};
pub use types::*;
