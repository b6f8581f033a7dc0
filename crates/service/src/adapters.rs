//! Input source adapters.

use std::fmt::Debug;

use tokio::sync::mpsc;

use crate::types::*;

/// Adapter for using an [`Iterator`] as a [`SyncServiceInput`].
#[derive(Debug)]
pub struct IterInput<I> {
    iter: I,
    closed: bool,
}

impl<I> IterInput<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            closed: false,
        }
    }
}

impl<I: Iterator> ServiceInput for IterInput<I>
where
    I::Item: Debug,
{
    type Msg = I::Item;
}

impl<I: Iterator + Send + 'static> SyncServiceInput for IterInput<I>
where
    I::Item: Debug,
{
    fn recv_next(&mut self) -> anyhow::Result<Option<Self::Msg>> {
        // We fuse it off ourselves just in case, it'd be weird not to.
        if self.closed {
            return Ok(None);
        }

        let item = self.iter.next();
        self.closed |= item.is_none();
        Ok(item)
    }
}

/// Adapter for using a mpsc receiver as an input.
///
/// The input ends when every sender has been dropped and the channel has
/// been fully drained, which gives channel-fed services drain-on-shutdown
/// semantics for free.
#[derive(Debug)]
pub struct TokioMpscInput<T> {
    rx: mpsc::Receiver<T>,
    closed: bool,
}

impl<T> TokioMpscInput<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx, closed: false }
    }
}

impl<T: Debug> ServiceInput for TokioMpscInput<T> {
    type Msg = T;
}

impl<T: Debug + Send + 'static> AsyncServiceInput for TokioMpscInput<T> {
    async fn recv_next(&mut self) -> anyhow::Result<Option<Self::Msg>> {
        // We fuse it off ourselves just in case, it'd be weird not to.
        if self.closed {
            return Ok(None);
        }

        let item = self.rx.recv().await;
        self.closed |= item.is_none();
        Ok(item)
    }
}
