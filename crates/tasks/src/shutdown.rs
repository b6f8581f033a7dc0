//! Shutdown signalling primitives.

use tokio::sync::watch;

/// Sender half used to initiate a shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), rx)
    }

    /// Triggers shutdown. Idempotent.
    pub fn send(&self) {
        // Receivers may all have exited already, that's fine.
        let _ = self.0.send(true);
    }
}

/// Receiver half handed to tasks so they can observe shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownGuard {
    rx: watch::Receiver<bool>,
}

impl ShutdownGuard {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Whether shutdown has been requested. Tasks must check this at every
    /// loop iteration and blocking point.
    pub fn should_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown is requested. Usable inside `tokio::select!`
    /// to make any wait cancellable.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.rx.clone();
        // If the sender is gone treat it as a shutdown.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_observed() {
        let (signal, rx) = ShutdownSignal::new();
        let guard = ShutdownGuard::new(rx);
        assert!(!guard.should_shutdown());
        signal.send();
        assert!(guard.should_shutdown());
        guard.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (signal, rx) = ShutdownSignal::new();
        let guard = ShutdownGuard::new(rx);
        drop(signal);
        guard.wait_for_shutdown().await;
    }
}
