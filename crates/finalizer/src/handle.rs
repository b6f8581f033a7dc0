//! Administrative handle to the finalizer.

use moraine_primitives::ClosingReason;
use moraine_service::{CommandHandle, ServiceError};
use serde::Serialize;
use tokio::sync::{oneshot, watch};

/// Commands the control loop honors at the next batch boundary.
///
/// The acknowledgment fires when the command is *accepted*, not when it
/// takes effect.
#[derive(Debug)]
pub(crate) enum CtlCommand {
    StopAfterCurrentBatch { ack: oneshot::Sender<()> },
    StopAtBatch { batch: u64, ack: oneshot::Sender<()> },
    Resume { ack: oneshot::Sender<()> },
}

/// Externally visible finalizer state.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizerStatus {
    pub batch_number: u64,
    pub block_tracking_num: u64,
    pub batch_tx_count: u64,
    pub paused: bool,
    pub last_closing_reason: ClosingReason,
}

impl Default for FinalizerStatus {
    fn default() -> Self {
        Self {
            batch_number: 0,
            block_tracking_num: 0,
            batch_tx_count: 0,
            paused: false,
            last_closing_reason: ClosingReason::StillOpen,
        }
    }
}

/// Handle for the control surface: stop/resume plus status.
#[derive(Debug, Clone)]
pub struct FinalizerHandle {
    ctl: CommandHandle<CtlCommand>,
    status_rx: watch::Receiver<FinalizerStatus>,
}

impl FinalizerHandle {
    pub(crate) fn new(
        ctl: CommandHandle<CtlCommand>,
        status_rx: watch::Receiver<FinalizerStatus>,
    ) -> Self {
        Self { ctl, status_rx }
    }

    /// Requests a pause once the current batch closes. Returns when the
    /// request is accepted.
    pub async fn stop_after_current_batch(&self) -> Result<(), ServiceError> {
        self.ctl
            .send_and_wait(|ack| CtlCommand::StopAfterCurrentBatch { ack })
            .await
    }

    /// Requests a pause once batch `batch` has closed.
    pub async fn stop_at_batch(&self, batch: u64) -> Result<(), ServiceError> {
        self.ctl
            .send_and_wait(|ack| CtlCommand::StopAtBatch { batch, ack })
            .await
    }

    /// Resumes a paused finalizer.
    pub async fn resume(&self) -> Result<(), ServiceError> {
        self.ctl.send_and_wait(|ack| CtlCommand::Resume { ack }).await
    }

    /// Latest published status.
    pub fn status(&self) -> FinalizerStatus {
        self.status_rx.borrow().clone()
    }

    /// Completes when the status changes.
    pub async fn status_changed(&mut self) -> Result<FinalizerStatus, ServiceError> {
        self.status_rx
            .changed()
            .await
            .map_err(|_| ServiceError::WorkerExited)?;
        Ok(self.status_rx.borrow().clone())
    }
}
