//! Task manager and executor.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::FutureExt;
use tokio::{runtime::Handle, sync::watch};
use tracing::*;

use crate::shutdown::{ShutdownGuard, ShutdownSignal};

/// Owns the shutdown channel and tracks spawned tasks so the process can
/// drain them before exiting.
#[derive(Debug)]
pub struct TaskManager {
    handle: Handle,
    signal: ShutdownSignal,
    shutdown_rx: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    pending_rx: watch::Receiver<usize>,
    pending_tx: watch::Sender<usize>,
}

impl TaskManager {
    pub fn new(handle: Handle) -> Self {
        let (signal, shutdown_rx) = ShutdownSignal::new();
        let (pending_tx, pending_rx) = watch::channel(0);
        Self {
            handle,
            signal,
            shutdown_rx,
            pending: Arc::new(AtomicUsize::new(0)),
            pending_rx,
            pending_tx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            signal: self.signal.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            pending: self.pending.clone(),
            pending_tx: self.pending_tx.clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard::new(self.shutdown_rx.clone())
    }

    /// Waits until shutdown is signalled, then until every tracked task has
    /// exited.
    pub async fn monitor(&self) {
        self.shutdown_guard().wait_for_shutdown().await;
        info!("shutdown requested, draining tasks");
        let mut rx = self.pending_rx.clone();
        while *rx.borrow_and_update() > 0 {
            if rx.changed().await.is_err() {
                break;
            }
        }
        info!("all tasks drained");
    }
}

/// Handle for spawning tracked tasks onto the runtime.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    handle: Handle,
    signal: ShutdownSignal,
    shutdown_rx: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    pending_tx: watch::Sender<usize>,
}

impl TaskExecutor {
    pub fn runtime_handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard::new(self.shutdown_rx.clone())
    }

    fn track_start(&self) {
        let n = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.pending_tx.send(n);
    }

    fn track_end(&self) {
        let n = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        let _ = self.pending_tx.send(n);
    }

    /// Spawns an async task whose failure or panic triggers shutdown.
    pub fn spawn_critical_async<F>(&self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        self.track_start();
        self.handle.spawn(async move {
            let res = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            match res {
                Ok(Ok(())) => debug!(%name, "critical task exited cleanly"),
                Ok(Err(e)) => {
                    error!(%name, %e, "critical task failed, requesting shutdown");
                    this.signal.send();
                }
                Err(_) => {
                    error!(%name, "critical task panicked, requesting shutdown");
                    this.signal.send();
                }
            }
            this.track_end();
        });
    }

    /// Spawns an async task that receives a [`ShutdownGuard`].
    pub fn spawn_critical_async_with_shutdown<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(ShutdownGuard) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = self.shutdown_guard();
        self.spawn_critical_async(name, async move { f(guard).await });
    }

    /// Spawns a blocking (thread) task whose failure or panic triggers
    /// shutdown.
    pub fn spawn_critical<F>(&self, name: &'static str, f: F)
    where
        F: FnOnce(ShutdownGuard) -> anyhow::Result<()> + Send + 'static,
    {
        let this = self.clone();
        let guard = self.shutdown_guard();
        self.track_start();
        self.handle.spawn_blocking(move || {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || f(guard)));
            match res {
                Ok(Ok(())) => debug!(%name, "critical task exited cleanly"),
                Ok(Err(e)) => {
                    error!(%name, %e, "critical task failed, requesting shutdown");
                    this.signal.send();
                }
                Err(_) => {
                    error!(%name, "critical task panicked, requesting shutdown");
                    this.signal.send();
                }
            }
            this.track_end();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_error_triggers_shutdown() {
        let manager = TaskManager::new(Handle::current());
        let exec = manager.executor();
        exec.spawn_critical_async("failing", async { anyhow::bail!("boom") });
        manager.monitor().await;
        assert!(manager.shutdown_guard().should_shutdown());
    }

    #[tokio::test]
    async fn test_panic_triggers_shutdown() {
        let manager = TaskManager::new(Handle::current());
        let exec = manager.executor();
        exec.spawn_critical_async("panicking", async { panic!("boom") });
        manager.monitor().await;
        assert!(manager.shutdown_guard().should_shutdown());
    }

    #[tokio::test]
    async fn test_monitor_drains_tasks() {
        let manager = TaskManager::new(Handle::current());
        let exec = manager.executor();

        exec.spawn_critical_async_with_shutdown("looper", |guard| async move {
            guard.wait_for_shutdown().await;
            // Simulated drain work after observing the signal.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });

        manager.shutdown_signal().send();
        tokio::time::timeout(Duration::from_secs(5), manager.monitor())
            .await
            .expect("monitor should complete after drain");
    }
}
