//! The closing-signals manager and its poller tasks.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use moraine_config::ConfigHandle;
use moraine_db::{ExitRootUpdate, ForcedBatch, SequencerDb};
use moraine_tasks::{ShutdownGuard, TaskExecutor};
use tokio::sync::mpsc;
use tracing::*;

use crate::types::{ClosingSignalChannels, L1SilenceTimeout, ReorgNotifier};

/// Bound of each delivery channel. Small on purpose: a consumer that falls
/// this far behind should exert backpressure on its own poller.
const SIGNAL_CHANNEL_SIZE: usize = 16;

/// Spawns the three closing-signal pollers.
#[derive(Debug)]
pub struct ClosingSignalsManager<D> {
    db: Arc<D>,
    config: ConfigHandle,
}

impl<D: SequencerDb> ClosingSignalsManager<D> {
    pub fn new(db: Arc<D>, config: ConfigHandle) -> Self {
        Self { db, config }
    }

    /// Launches the pollers and hands back the consumer channels plus the
    /// reorg notifier for the synchronizer side.
    pub fn start(self, texec: &TaskExecutor) -> (ClosingSignalChannels, ReorgNotifier) {
        let (forced_tx, forced_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let (exit_root_tx, exit_root_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let (timeout_tx, timeout_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let (reorg_tx, reorg_rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);

        let db = self.db.clone();
        let config = self.config.clone();
        texec.spawn_critical_async_with_shutdown("forced_batch_poller", move |guard| {
            forced_batch_poller_task(guard, db, config, forced_tx)
        });

        let db = self.db.clone();
        let config = self.config.clone();
        texec.spawn_critical_async_with_shutdown("exit_root_poller", move |guard| {
            exit_root_poller_task(guard, db, config, exit_root_tx)
        });

        let db = self.db;
        let config = self.config;
        texec.spawn_critical_async_with_shutdown("l1_silence_poller", move |guard| {
            l1_silence_poller_task(guard, db, config, timeout_tx)
        });

        (
            ClosingSignalChannels {
                forced_rx,
                exit_root_rx,
                timeout_rx,
                reorg_rx,
            },
            ReorgNotifier::new(reorg_tx),
        )
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_secs()
}

/// Sleeps for `dur` unless shutdown arrives first; returns false on
/// shutdown.
async fn sleep_or_shutdown(guard: &ShutdownGuard, dur: Duration) -> bool {
    tokio::select! {
        _ = guard.wait_for_shutdown() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

/// Watches for newly confirmed forced batches and delivers them in
/// ascending sequence order.
async fn forced_batch_poller_task<D: SequencerDb>(
    guard: ShutdownGuard,
    db: Arc<D>,
    config: ConfigHandle,
    tx: mpsc::Sender<ForcedBatch>,
) -> anyhow::Result<()> {
    info!("started forced batch poller");

    // Watermark of the last delivered forced batch; picked up from the
    // trusted state on (re)start.
    let mut watermark: Option<u64> = None;

    loop {
        let cfg = config.snapshot();
        let interval = Duration::from_millis(cfg.pollers.forced_batch_check_interval_ms);
        if !sleep_or_shutdown(&guard, interval).await {
            return Ok(());
        }

        if watermark.is_none() {
            match db.last_trusted_forced_batch_number().await {
                Ok(n) => watermark = Some(n),
                Err(e) => {
                    warn!(%e, "failed to get last trusted forced batch number");
                    continue;
                }
            }
        }
        let since = watermark.expect("poller: watermark just set");

        let head = match db.l1_head_block().await {
            Ok(h) => h,
            Err(e) => {
                warn!(%e, "failed to get L1 head");
                continue;
            }
        };
        let max_block = head.saturating_sub(cfg.pollers.forced_batch_l1_confirmations);

        let batches = match db.forced_batches_since(since, max_block).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%e, "failed to check forced batches");
                continue;
            }
        };

        for fb in batches {
            debug!(forced = %fb.number, l1_block = %fb.l1_block, "delivering forced batch");
            let number = fb.number;
            if tx.send(fb).await.is_err() {
                // Consumer is gone, we're shutting down.
                return Ok(());
            }
            watermark = Some(number);
        }
    }
}

/// Watches the finality-confirmed exit root and delivers it when it
/// changes.
async fn exit_root_poller_task<D: SequencerDb>(
    guard: ShutdownGuard,
    db: Arc<D>,
    config: ConfigHandle,
    tx: mpsc::Sender<ExitRootUpdate>,
) -> anyhow::Result<()> {
    info!("started exit root poller");

    let mut last_delivered = None;

    loop {
        let cfg = config.snapshot();
        let interval = Duration::from_millis(cfg.pollers.exit_root_check_interval_ms);
        if !sleep_or_shutdown(&guard, interval).await {
            return Ok(());
        }

        let head = match db.l1_head_block().await {
            Ok(h) => h,
            Err(e) => {
                warn!(%e, "failed to get L1 head");
                continue;
            }
        };
        let max_block = head.saturating_sub(cfg.pollers.exit_root_l1_confirmations);

        match db.latest_exit_root(max_block).await {
            Ok(Some(update)) => {
                if last_delivered != Some(update.root) {
                    debug!(root = %update.root, l1_block = %update.l1_block, "delivering exit root update");
                    last_delivered = Some(update.root);
                    if tx.send(update).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%e, "failed to get latest exit root"),
        }
    }
}

/// Fires when L1 has gone silent for too long. Sleeps until the bound
/// would next be exceeded instead of polling at a fixed rate.
async fn l1_silence_poller_task<D: SequencerDb>(
    guard: ShutdownGuard,
    db: Arc<D>,
    config: ConfigHandle,
    tx: mpsc::Sender<L1SilenceTimeout>,
) -> anyhow::Result<()> {
    info!("started L1 silence poller");

    loop {
        let cfg = config.snapshot();
        let bound = cfg.pollers.l1_silence_bound_secs;
        let min_poll = Duration::from_millis(cfg.pollers.l1_silence_min_poll_ms);

        let wait = match db.last_virtualized_batch_timestamp().await {
            Ok(last_ts) => {
                let now = unix_now();
                let deadline = last_ts.saturating_add(bound);
                if now >= deadline {
                    let signal = L1SilenceTimeout {
                        last_virtualized_ts: last_ts,
                        silent_for_secs: now - last_ts,
                    };
                    info!(silent_for = %signal.silent_for_secs, "L1 silence bound exceeded");
                    if tx.send(signal).await.is_err() {
                        return Ok(());
                    }
                    // Nothing new can exceed the bound before a fresh
                    // virtualization plus the full bound.
                    Duration::from_secs(bound)
                } else {
                    Duration::from_secs(deadline - now)
                }
            }
            Err(e) => {
                warn!(%e, "failed to get last virtualization timestamp");
                min_poll
            }
        };

        if !sleep_or_shutdown(&guard, wait.max(min_poll)).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use moraine_config::Config;
    use moraine_db::test_utils::MemBackend;
    use moraine_primitives::{Buf32, ExitRoot};
    use moraine_tasks::TaskManager;

    use super::*;

    fn forced(number: u64, l1_block: u64) -> ForcedBatch {
        ForcedBatch {
            number,
            l1_block,
            exit_root: ExitRoot::zero(),
            raw_txs: vec![0xaa],
            forced_at: 1,
        }
    }

    fn test_config() -> ConfigHandle {
        let mut config = Config::default();
        config.pollers.forced_batch_check_interval_ms = 10;
        config.pollers.forced_batch_l1_confirmations = 2;
        config.pollers.exit_root_check_interval_ms = 10;
        config.pollers.exit_root_l1_confirmations = 2;
        config.pollers.l1_silence_bound_secs = 60;
        config.pollers.l1_silence_min_poll_ms = 10;
        ConfigHandle::new(config)
    }

    struct TestEnv {
        backend: Arc<MemBackend>,
        channels: ClosingSignalChannels,
        manager: TaskManager,
    }

    fn start_env(backend: Arc<MemBackend>) -> TestEnv {
        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let texec = manager.executor();
        let (channels, _reorg) =
            ClosingSignalsManager::new(backend.clone(), test_config()).start(&texec);
        TestEnv {
            backend,
            channels,
            manager,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_poller_delivers_confirmed_in_order() {
        let backend = Arc::new(MemBackend::new());
        backend.set_l1_head(100);
        // Number 3 sits above the confirmation cutoff at first.
        backend.push_forced_batch(forced(2, 50));
        backend.push_forced_batch(forced(1, 40));
        backend.push_forced_batch(forced(3, 99));

        let mut env = start_env(backend);

        let first = env.channels.forced_rx.recv().await.unwrap();
        let second = env.channels.forced_rx.recv().await.unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);

        // Number 3 is above the confirmation cutoff (99 > 100 - 2).
        assert!(env.channels.forced_rx.try_recv().is_err());

        // Once L1 advances it gets delivered too.
        env.backend.set_l1_head(105);
        let third = env.channels.forced_rx.recv().await.unwrap();
        assert_eq!(third.number, 3);

        env.manager.shutdown_signal().send();
        env.manager.monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_poller_resumes_from_trusted_watermark() {
        let backend = Arc::new(MemBackend::new());
        backend.set_l1_head(100);
        backend.set_last_trusted_forced(2);
        backend.push_forced_batch(forced(1, 10));
        backend.push_forced_batch(forced(2, 11));
        backend.push_forced_batch(forced(3, 12));

        let mut env = start_env(backend);

        // Batches at or below the trusted watermark are never re-delivered.
        let only = env.channels.forced_rx.recv().await.unwrap();
        assert_eq!(only.number, 3);

        env.manager.shutdown_signal().send();
        env.manager.monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_root_poller_delivers_only_changes() {
        let backend = Arc::new(MemBackend::new());
        backend.set_l1_head(100);
        let root_a = ExitRoot::from(Buf32::new([1; 32]));
        backend.push_exit_root(ExitRootUpdate {
            root: root_a,
            l1_block: 10,
            timestamp: 1,
        });

        let mut env = start_env(backend);

        let update = env.channels.exit_root_rx.recv().await.unwrap();
        assert_eq!(update.root, root_a);

        // Same root again: nothing delivered.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(env.channels.exit_root_rx.try_recv().is_err());

        // A new root at a confirmed height is delivered.
        let root_b = ExitRoot::from(Buf32::new([2; 32]));
        env.backend.push_exit_root(ExitRootUpdate {
            root: root_b,
            l1_block: 20,
            timestamp: 2,
        });
        let update = env.channels.exit_root_rx.recv().await.unwrap();
        assert_eq!(update.root, root_b);

        env.manager.shutdown_signal().send();
        env.manager.monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_poller_fires_when_bound_exceeded() {
        let backend = Arc::new(MemBackend::new());
        // Last virtualization far in the past.
        backend.set_last_virtualized_ts(unix_now().saturating_sub(1_000));

        let mut env = start_env(backend);

        let signal = env.channels.timeout_rx.recv().await.unwrap();
        assert!(signal.silent_for_secs >= 1_000);

        env.manager.shutdown_signal().send();
        env.manager.monitor().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_poller_quiet_before_deadline() {
        let backend = Arc::new(MemBackend::new());
        backend.set_last_virtualized_ts(unix_now());

        let mut env = start_env(backend);

        // The bound is 60s of wall-clock, which paused tokio time never
        // reaches; the poller must stay quiet.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(env.channels.timeout_rx.try_recv().is_err());

        env.manager.shutdown_signal().send();
        env.manager.monitor().await;
    }
}
