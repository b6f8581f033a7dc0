//! Pool intake loop.
//!
//! Pulls pending candidates from the pool into the worker and reports
//! admission rejections back. Candidates the worker gave a home stay
//! pending in the pool until a stored block marks them selected.

use std::{collections::HashSet, sync::Arc, time::Duration};

use moraine_config::ConfigHandle;
use moraine_db::{StateReader, TxPool};
use moraine_primitives::TxHash;
use moraine_tasks::ShutdownGuard;
use moraine_worker::{Worker, WorkerError};
use tracing::*;

/// Bound on the per-process admitted-hash memory before it is rebuilt.
const SEEN_SET_LIMIT: usize = 100_000;

pub(crate) async fn pool_intake_task<P, S>(
    guard: ShutdownGuard,
    pool: Arc<P>,
    worker: Arc<Worker<S>>,
    config: ConfigHandle,
) -> anyhow::Result<()>
where
    P: TxPool,
    S: StateReader,
{
    info!("started pool intake");

    // Hashes already handed to the worker, so a candidate that stays
    // pending until it is stored isn't re-admitted meanwhile.
    let mut seen: HashSet<TxHash> = HashSet::new();

    loop {
        let cfg = config.snapshot();
        let interval = Duration::from_millis(cfg.pollers.pool_intake_interval_ms);
        tokio::select! {
            _ = guard.wait_for_shutdown() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        if seen.len() > SEEN_SET_LIMIT {
            seen.clear();
        }

        let limit = cfg.constraints.max_txs_per_batch as usize;
        let candidates = match pool.ready_candidates(limit).await {
            Ok(c) => c,
            Err(e) => {
                warn!(%e, "failed to fetch pool candidates");
                continue;
            }
        };

        for candidate in candidates {
            let hash = candidate.hash;
            if seen.contains(&hash) {
                continue;
            }

            match worker.add_tx(candidate).await {
                Ok(replaced) => {
                    seen.insert(hash);
                    if let Some(replaced) = replaced {
                        report_failed(pool.as_ref(), replaced, "replaced by better price").await;
                    }
                }
                Err(WorkerError::OutOfCounters) => {
                    seen.insert(hash);
                    if let Err(e) = pool.mark_invalid(hash, "exceeds batch constraints").await {
                        warn!(txh = %hash, %e, "failed to update pool status");
                    }
                }
                Err(e @ WorkerError::StaleNonce) | Err(e @ WorkerError::DuplicateNonce) => {
                    seen.insert(hash);
                    report_failed(pool.as_ref(), hash, &e.to_string()).await;
                }
                Err(WorkerError::Db(e)) => {
                    // State temporarily unreadable; retry the whole sweep.
                    warn!(txh = %hash, %e, "state read failed during intake");
                    break;
                }
                Err(e) => {
                    warn!(txh = %hash, %e, "unexpected admission error");
                }
            }
        }
    }
}

async fn report_failed<P: TxPool>(pool: &P, hash: TxHash, reason: &str) {
    if let Err(e) = pool.mark_failed(hash, reason).await {
        warn!(txh = %hash, %e, "failed to update pool status");
    }
}

#[cfg(test)]
mod tests {
    use ethnum::U256;
    use moraine_db::{test_utils::MemBackend, PendingTx, TxStatus};
    use moraine_primitives::{Address, BatchConstraints, BatchResources};
    use moraine_tasks::TaskManager;
    use moraine_worker::WeightedScorer;

    use super::*;

    fn pending(hash_byte: u8, from: Address, nonce: u64) -> PendingTx {
        PendingTx {
            hash: TxHash::new([hash_byte; 32]),
            from,
            nonce,
            gas: 21_000,
            gas_price: U256::from(10u64),
            cost: U256::from(5u64),
            raw: vec![hash_byte; 16],
            reserved_resources: BatchResources::default(),
            received_at: 0,
            submitter: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_intake_admits_and_reports() {
        let backend = Arc::new(MemBackend::new());
        let sender = Address::new([1; 20]);
        backend.set_account(sender, 0, U256::from(100u64));

        // One good candidate, one whose nonce is already consumed.
        backend.push_pool_tx(pending(1, sender, 0));
        let stale_sender = Address::new([2; 20]);
        backend.set_account(stale_sender, 7, U256::from(100u64));
        backend.push_pool_tx(pending(2, stale_sender, 0));

        let mut config = moraine_config::Config::default();
        config.pollers.pool_intake_interval_ms = 10;
        let config = ConfigHandle::new(config);

        let constraints = BatchConstraints::default();
        let scorer = Arc::new(WeightedScorer::new(
            constraints,
            &config.snapshot().worker.weights,
            1.0,
        ));
        let worker = Arc::new(Worker::new(backend.clone(), constraints, scorer));

        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let texec = manager.executor();
        {
            let pool = backend.clone();
            let worker = worker.clone();
            let config = config.clone();
            texec.spawn_critical_async_with_shutdown("pool_intake", move |guard| {
                pool_intake_task(guard, pool, worker, config)
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while worker.ready_count() < 1 || backend.pool_status(&TxHash::new([2; 32])).unwrap()
            == TxStatus::Pending
        {
            assert!(tokio::time::Instant::now() < deadline, "intake timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Good tx admitted, stale one reported failed.
        assert_eq!(worker.ready_count(), 1);
        assert_eq!(
            backend.pool_status(&TxHash::new([2; 32])),
            Some(TxStatus::Failed)
        );

        manager.shutdown_signal().send();
        manager.monitor().await;
    }
}
