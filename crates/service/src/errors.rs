//! Service framework errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The worker's input channel is closed, the worker has exited.
    #[error("service worker exited")]
    WorkerExited,

    /// The worker accepted a message but dropped the response sender.
    #[error("service worker exited without responding")]
    WorkerExitedWithoutResponse,
}
