//! Sequencer builder.

use std::sync::Arc;

use moraine_config::ConfigHandle;
use moraine_db::{SequencerDb, StateReader, TxPool};
use moraine_engine::ExecEngine;
use moraine_finalizer::{Finalizer, FinalizerHandle};
use moraine_signals::{ClosingSignalsManager, ReorgNotifier};
use moraine_tasks::TaskExecutor;
use moraine_worker::{EfficiencyScorer, WeightedScorer, Worker};

use crate::intake::pool_intake_task;

/// Assembles the sequencer services.
pub struct SequencerBuilder<E, D, P, S> {
    config: ConfigHandle,
    engine: Arc<E>,
    db: Arc<D>,
    pool: Arc<P>,
    state: Arc<S>,
    scorer: Option<Arc<dyn EfficiencyScorer>>,
}

impl<E, D, P, S> std::fmt::Debug for SequencerBuilder<E, D, P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerBuilder").finish()
    }
}

impl<E, D, P, S> SequencerBuilder<E, D, P, S>
where
    E: ExecEngine,
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    pub fn new(
        config: ConfigHandle,
        engine: Arc<E>,
        db: Arc<D>,
        pool: Arc<P>,
        state: Arc<S>,
    ) -> Self {
        Self {
            config,
            engine,
            db,
            pool,
            state,
            scorer: None,
        }
    }

    /// Overrides the efficiency scoring policy.
    pub fn with_scorer(mut self, scorer: Arc<dyn EfficiencyScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Launches every sequencer service onto the executor.
    pub fn launch(self, texec: &TaskExecutor) -> anyhow::Result<SequencerHandle<S>> {
        let cfg = self.config.snapshot();

        let scorer = self.scorer.unwrap_or_else(|| {
            Arc::new(WeightedScorer::new(
                cfg.constraints,
                &cfg.worker.weights,
                cfg.worker.resource_cost_multiplier,
            ))
        });
        let worker = Arc::new(Worker::new(self.state, cfg.constraints, scorer));

        let (signals, reorg) =
            ClosingSignalsManager::new(self.db.clone(), self.config.clone()).start(texec);

        let finalizer = Finalizer::start(
            self.config.clone(),
            self.engine,
            self.db,
            self.pool.clone(),
            worker.clone(),
            signals,
            texec,
        )?;

        {
            let pool = self.pool;
            let worker = worker.clone();
            let config = self.config;
            texec.spawn_critical_async_with_shutdown("pool_intake", move |guard| {
                pool_intake_task(guard, pool, worker, config)
            });
        }

        Ok(SequencerHandle {
            finalizer,
            reorg,
            worker,
        })
    }
}

/// Handles to a running sequencer.
pub struct SequencerHandle<S> {
    /// Admin control and status of the finalizer.
    pub finalizer: FinalizerHandle,

    /// For the synchronizer: raises the L2-reorg recovery signal.
    pub reorg: ReorgNotifier,

    worker: Arc<Worker<S>>,
}

impl<S> std::fmt::Debug for SequencerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerHandle")
            .field("finalizer", &self.finalizer)
            .finish()
    }
}

impl<S: StateReader> SequencerHandle<S> {
    /// Number of ready candidates currently queued.
    pub fn ready_txs(&self) -> usize {
        self.worker.ready_count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ethnum::U256;
    use moraine_db::{test_utils::MemBackend, PendingTx, TxStatus};
    use moraine_finalizer::test_utils::SimEngine;
    use moraine_primitives::{Address, BatchResources, TxHash};
    use moraine_tasks::TaskManager;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_pool_to_closed_batch() {
        let backend = Arc::new(MemBackend::new());
        let engine = Arc::new(SimEngine::new(backend.clone()));

        let sender = Address::new([1; 20]);
        backend.set_account(sender, 0, U256::from(100u64));
        let txh = TxHash::new([1; 32]);
        backend.push_pool_tx(PendingTx {
            hash: txh,
            from: sender,
            nonce: 0,
            gas: 21_000,
            gas_price: U256::from(10u64),
            cost: U256::from(5u64),
            raw: vec![1; 16],
            reserved_resources: BatchResources::default(),
            received_at: 0,
            submitter: None,
        });

        let mut config = moraine_config::Config::default();
        config.coinbase = Address::new([0xc0; 20]);
        config.finalizer.new_tx_wait_ms = 5;
        config.finalizer.block_period_secs = 0;
        config.finalizer.timestamp_resolution_secs = 0;
        config.finalizer.flush_id_poll_ms = 10;
        config.pollers.pool_intake_interval_ms = 10;
        let config = ConfigHandle::new(config);

        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let texec = manager.executor();

        let handle = SequencerBuilder::new(
            config,
            engine,
            backend.clone(),
            backend.clone(),
            backend.clone(),
        )
        .launch(&texec)
        .expect("sequencer should launch");

        // The pool candidate flows intake -> worker -> finalizer -> store.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while backend.batch_receipt(1).is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "batch never closed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(backend.pool_status(&txh), Some(TxStatus::Selected));
        assert!(backend.batch_block_count(1) >= 1);
        assert!(handle.finalizer.status().batch_number >= 1);

        manager.shutdown_signal().send();
        tokio::time::timeout(Duration::from_secs(30), manager.monitor())
            .await
            .expect("drain should complete");
    }
}
