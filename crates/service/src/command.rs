//! Command handle for sending messages into a channel-fed worker.

use std::fmt::Debug;

use tokio::sync::{mpsc, oneshot};

use crate::errors::ServiceError;

/// Handle to send inputs to a worker task.
#[derive(Debug)]
pub struct CommandHandle<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for CommandHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Debug + Send + 'static> CommandHandle<M> {
    /// Constructs a new instance.
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx }
    }

    /// Returns the number of pending inputs that have not been processed
    /// yet as of the moment of calling.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Sends a message on the channel and returns immediately.
    pub async fn send(&self, m: M) -> Result<(), ServiceError> {
        if self.tx.send(m).await.is_err() {
            return Err(ServiceError::WorkerExited);
        }

        Ok(())
    }

    /// Sends a message on the channel and returns immediately.
    pub fn send_blocking(&self, m: M) -> Result<(), ServiceError> {
        if self.tx.blocking_send(m).is_err() {
            return Err(ServiceError::WorkerExited);
        }

        Ok(())
    }

    /// Accepts a message constructor accepting a callback sender, sends the
    /// message, then waits for the response.
    pub async fn send_and_wait<R>(
        &self,
        mfn: impl FnOnce(oneshot::Sender<R>) -> M,
    ) -> Result<R, ServiceError> {
        let (ret_tx, ret_rx) = oneshot::channel();
        let m = mfn(ret_tx);

        self.send(m).await?;
        coerce_callback_result(ret_rx.await)
    }

    /// Accepts a message constructor accepting a callback sender, sends the
    /// message, then waits for the response.
    pub fn send_and_wait_blocking<R>(
        &self,
        mfn: impl FnOnce(oneshot::Sender<R>) -> M,
    ) -> Result<R, ServiceError> {
        let (ret_tx, ret_rx) = oneshot::channel();
        let m = mfn(ret_tx);

        self.send_blocking(m)?;
        coerce_callback_result(ret_rx.blocking_recv())
    }
}

fn coerce_callback_result<R>(v: Result<R, oneshot::error::RecvError>) -> Result<R, ServiceError> {
    v.map_err(|_| ServiceError::WorkerExitedWithoutResponse)
}
