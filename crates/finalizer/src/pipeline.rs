//! The execute/store pipeline.
//!
//! Closed sub-blocks flow to-process → (engine) → to-store → (persist).
//! Both hand-offs are bounded FIFO channels; the store stage additionally
//! gates on the engine's durable flush id so a block is never persisted
//! before its execution trace is safe.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use moraine_common::retry::{
    retry_with_backoff_async, ExponentialBackoff, DEFAULT_DB_CALL_MAX_RETRIES,
    DEFAULT_ENGINE_CALL_MAX_RETRIES,
};
use moraine_config::ConfigHandle;
use moraine_db::{SequencerDb, StateReader, StoredBlock, TxPool};
use moraine_engine::{
    BlockContext, BlockExecOutput, BlockExecRequest, EngineError, ExecEngine, ExecPayload,
};
use moraine_primitives::{Address, BatchResources, ExitRoot, StateRoot};
use moraine_service::{
    AsyncService, Response, Service, ServiceBuilder, ServiceState, TokioMpscInput,
};
use moraine_tasks::{ShutdownGuard, TaskExecutor};
use moraine_worker::Worker;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::*;

use crate::{
    block::WipBlock,
    errors::{FinalizerError, FinalizerResult},
};

/// A sub-block that has been executed and awaits persistence.
#[derive(Debug)]
pub(crate) struct ExecutedBlock {
    pub(crate) block: WipBlock,
    pub(crate) exec: BlockExecOutput,
}

/// The pipeline's view of the open batch: the state root and budget as
/// they advance block by block, behind the immediate view of the control
/// loop. The control loop resets it at batch boundaries, after draining.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedFinalView {
    inner: Arc<Mutex<FinalView>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FinalView {
    pub(crate) state_root: StateRoot,
    pub(crate) local_exit_root: ExitRoot,
    pub(crate) remaining: BatchResources,
}

impl SharedFinalView {
    pub(crate) fn reset(&self, state_root: StateRoot, remaining: BatchResources) {
        let mut view = self.inner.lock();
        *view = FinalView {
            state_root,
            local_exit_root: ExitRoot::zero(),
            remaining,
        };
    }

    pub(crate) fn get(&self) -> FinalView {
        self.inner.lock().clone()
    }

    /// Accounts one executed block. Reserved overflow is only warned (the
    /// batch will close on the immediate view), used overflow is fatal.
    fn apply(&self, block: &WipBlock, exec: &BlockExecOutput) -> FinalizerResult<()> {
        let mut view = self.inner.lock();

        if let Err(overflow) = view.remaining.fits(&exec.reserved_resources) {
            warn!(
                block = %block.tracking_num,
                batch = %block.batch_number,
                %overflow,
                "block reserved resources exceed the remaining batch budget"
            );
        }
        view.remaining.checked_sub(&exec.used_resources)?;

        view.state_root = exec.new_state_root;
        view.local_exit_root = exec.new_local_exit_root;
        Ok(())
    }
}

/// Counts blocks handed to the pipeline that are not yet stored.
#[derive(Debug, Clone, Default)]
pub(crate) struct PipelineTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    in_flight: Mutex<u64>,
    changed: Notify,
}

impl PipelineTracker {
    pub(crate) fn submitted(&self) {
        *self.inner.in_flight.lock() += 1;
    }

    pub(crate) fn stored(&self) {
        let mut n = self.inner.in_flight.lock();
        *n = n.saturating_sub(1);
        drop(n);
        self.inner.changed.notify_waiters();
    }

    pub(crate) fn in_flight(&self) -> u64 {
        *self.inner.in_flight.lock()
    }

    /// Waits until every submitted block has been stored. The intentional
    /// backpressure point at batch close.
    pub(crate) async fn wait_idle(&self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        loop {
            let notified = self.inner.changed.notified();
            if self.in_flight() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = guard.wait_for_shutdown() => return Err(FinalizerError::Interrupted),
                _ = notified => {}
            }
        }
    }
}

/// Read side of the durable flush id.
#[derive(Debug, Clone)]
pub struct FlushMonitor {
    rx: watch::Receiver<u64>,
}

impl FlushMonitor {
    pub(crate) fn channel() -> (watch::Sender<u64>, Self) {
        let (tx, rx) = watch::channel(0);
        (tx, Self { rx })
    }

    pub fn current(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Blocks until the durable flush id reaches `flush_id`, or shutdown.
    pub async fn wait_durable(
        &self,
        flush_id: u64,
        guard: &ShutdownGuard,
    ) -> FinalizerResult<()> {
        let mut rx = self.rx.clone();
        while *rx.borrow_and_update() < flush_id {
            tokio::select! {
                _ = guard.wait_for_shutdown() => return Err(FinalizerError::Interrupted),
                res = rx.changed() => {
                    if res.is_err() {
                        return Err(FinalizerError::Interrupted);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Polls the store for the durable flush id and publishes it. Also the
/// engine-restart tripwire: a changed instance id invalidates outstanding
/// flush ids, which only a restart can recover from.
async fn flush_poller_task<D: SequencerDb>(
    guard: ShutdownGuard,
    db: Arc<D>,
    config: ConfigHandle,
    tx: watch::Sender<u64>,
) -> anyhow::Result<()> {
    let mut known_instance: Option<String> = None;

    loop {
        let poll = Duration::from_millis(config.snapshot().finalizer.flush_id_poll_ms);
        tokio::select! {
            _ = guard.wait_for_shutdown() => return Ok(()),
            _ = tokio::time::sleep(poll) => {}
        }

        match db.last_durable_flush_id().await {
            Ok((flush_id, instance)) => {
                if !instance.is_empty() {
                    match &known_instance {
                        Some(prev) if *prev != instance => {
                            error!(%prev, %instance, "engine instance changed, halting");
                            return Err(
                                FinalizerError::EngineRestarted(prev.clone(), instance).into()
                            );
                        }
                        Some(_) => {}
                        None => known_instance = Some(instance),
                    }
                }
                tx.send_if_modified(|cur| {
                    if flush_id > *cur {
                        *cur = flush_id;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => warn!(%e, "failed to poll durable flush id"),
        }
    }
}

/// Executes blocks in submission order.
struct ProcessStage<E> {
    _phantom: PhantomData<E>,
}

struct ProcessState<E> {
    engine: Arc<E>,
    coinbase: Address,
    shared: SharedFinalView,
    to_store: mpsc::Sender<ExecutedBlock>,
    backoff: ExponentialBackoff,
    processed_blocks: u64,
    last_tracking_num: u64,
}

impl<E: ExecEngine> ServiceState for ProcessState<E> {
    fn name(&self) -> &str {
        "block_process"
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProcessStatus {
    processed_blocks: u64,
    last_tracking_num: u64,
}

impl<E: ExecEngine> Service for ProcessStage<E> {
    type State = ProcessState<E>;
    type Msg = WipBlock;
    type Status = ProcessStatus;

    fn get_status(state: &Self::State) -> Self::Status {
        ProcessStatus {
            processed_blocks: state.processed_blocks,
            last_tracking_num: state.last_tracking_num,
        }
    }
}

impl<E: ExecEngine> AsyncService for ProcessStage<E> {
    async fn process_input(state: &mut Self::State, input: &WipBlock) -> anyhow::Result<Response> {
        let block = input.clone();
        let view = state.shared.get();

        debug!(
            block = %block.tracking_num,
            batch = %block.batch_number,
            txs = block.txs.len(),
            root = %view.state_root,
            "processing block"
        );

        let req = BlockExecRequest {
            context: BlockContext {
                batch_number: block.batch_number,
                coinbase: state.coinbase,
                timestamp: block.timestamp,
                delta_timestamp: block.delta_timestamp,
                exit_root: block.exit_root,
            },
            prior_state_root: view.state_root,
            payload: ExecPayload::Txs(block.txs.clone()),
        };

        let exec = exec_with_retry(state.engine.as_ref(), &state.backoff, req)
            .await
            .map_err(|e| {
                dump_block(&block);
                anyhow::Error::from(FinalizerError::from(e))
            })?;

        check_block_response(&block, &exec).inspect_err(|_| dump_block(&block))?;

        state.shared.apply(&block, &exec)?;

        state.processed_blocks += 1;
        state.last_tracking_num = block.tracking_num;

        info!(
            block = %block.tracking_num,
            batch = %block.batch_number,
            txs = block.txs.len(),
            new_root = %exec.new_state_root,
            flush_id = exec.flush_id,
            "processed block"
        );

        if state.to_store.send(ExecutedBlock { block, exec }).await.is_err() {
            // Store stage already wound down; nothing more to do here.
            return Ok(Response::ShouldExit);
        }
        Ok(Response::Continue)
    }
}

/// Persists executed blocks once their flush id is durable.
struct StoreStage<D, P, S> {
    _phantom: PhantomData<(D, P, S)>,
}

struct StoreState<D, P, S> {
    db: Arc<D>,
    pool: Arc<P>,
    worker: Arc<Worker<S>>,
    flush: FlushMonitor,
    tracker: PipelineTracker,
    guard: ShutdownGuard,
    backoff: ExponentialBackoff,
    stored_blocks: u64,
    last_flush_id: u64,
}

impl<D, P, S> ServiceState for StoreState<D, P, S>
where
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    fn name(&self) -> &str {
        "block_store"
    }
}

#[derive(Debug, Clone, Serialize)]
struct StoreStatus {
    stored_blocks: u64,
    last_flush_id: u64,
}

impl<D, P, S> Service for StoreStage<D, P, S>
where
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    type State = StoreState<D, P, S>;
    type Msg = ExecutedBlock;
    type Status = StoreStatus;

    fn get_status(state: &Self::State) -> Self::Status {
        StoreStatus {
            stored_blocks: state.stored_blocks,
            last_flush_id: state.last_flush_id,
        }
    }
}

impl<D, P, S> AsyncService for StoreStage<D, P, S>
where
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    async fn process_input(
        state: &mut Self::State,
        input: &ExecutedBlock,
    ) -> anyhow::Result<Response> {
        let ExecutedBlock { block, exec } = input;

        // Hold persistence until the engine's trace is durable.
        match state.flush.wait_durable(exec.flush_id, &state.guard).await {
            Ok(()) => {}
            Err(e) if e.is_interruption() => {
                warn!(
                    block = %block.tracking_num,
                    flush_id = exec.flush_id,
                    "shutdown while waiting for durability, leaving block unstored"
                );
                return Ok(Response::ShouldExit);
            }
            Err(e) => return Err(e.into()),
        }

        let stored = StoredBlock {
            batch_number: block.batch_number,
            tracking_num: block.tracking_num,
            timestamp: block.timestamp,
            delta_timestamp: block.delta_timestamp,
            exit_root: block.exit_root,
            raw_txs: block.txs.iter().map(|tx| tx.raw.clone()).collect(),
            exec: exec.clone(),
        };

        let db = state.db.clone();
        retry_with_backoff_async(
            "store_block",
            DEFAULT_DB_CALL_MAX_RETRIES,
            &state.backoff,
            || {
                let db = db.clone();
                let stored = stored.clone();
                async move { db.store_block(stored).await }
            },
        )
        .await
        .map_err(FinalizerError::from)?;

        // Report inclusion and release the pending-store pins.
        for tx in &block.txs {
            state
                .pool
                .mark_selected(tx.hash)
                .await
                .map_err(FinalizerError::from)?;
            state.worker.delete_pending_tx_to_store(&tx.hash, tx.from);
        }

        state.tracker.stored();
        state.stored_blocks += 1;
        state.last_flush_id = exec.flush_id;

        info!(
            block = %block.tracking_num,
            batch = %block.batch_number,
            txs = block.txs.len(),
            flush_id = exec.flush_id,
            "stored block"
        );

        Ok(Response::Continue)
    }
}

/// Producer-side handles of a running pipeline.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub(crate) to_process: mpsc::Sender<WipBlock>,
    pub(crate) tracker: PipelineTracker,
    pub(crate) shared: SharedFinalView,
    pub(crate) flush: FlushMonitor,
}

/// Launches both pipeline stages and the flush-id poller.
pub(crate) fn spawn_pipeline<E, D, P, S>(
    texec: &TaskExecutor,
    engine: Arc<E>,
    db: Arc<D>,
    pool: Arc<P>,
    worker: Arc<Worker<S>>,
    config: ConfigHandle,
    coinbase: Address,
) -> anyhow::Result<Pipeline>
where
    E: ExecEngine,
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    let buffer = config.snapshot().finalizer.pipeline_buffer_size;
    let (to_process_tx, to_process_rx) = mpsc::channel(buffer);
    let (to_store_tx, to_store_rx) = mpsc::channel(buffer);

    let (flush_tx, flush) = FlushMonitor::channel();
    let tracker = PipelineTracker::default();
    let shared = SharedFinalView::default();

    {
        let db = db.clone();
        let config = config.clone();
        texec.spawn_critical_async_with_shutdown("flush_id_poller", move |guard| {
            flush_poller_task(guard, db, config, flush_tx)
        });
    }

    ServiceBuilder::<ProcessStage<E>, _>::new()
        .with_state(ProcessState {
            engine,
            coinbase,
            shared: shared.clone(),
            to_store: to_store_tx,
            backoff: ExponentialBackoff::default(),
            processed_blocks: 0,
            last_tracking_num: 0,
        })
        .with_input(TokioMpscInput::new(to_process_rx))
        .launch_async("block_process", texec)?;

    ServiceBuilder::<StoreStage<D, P, S>, _>::new()
        .with_state(StoreState {
            db,
            pool,
            worker,
            flush: flush.clone(),
            tracker: tracker.clone(),
            guard: texec.shutdown_guard(),
            backoff: ExponentialBackoff::default(),
            stored_blocks: 0,
            last_flush_id: 0,
        })
        .with_input(TokioMpscInput::new(to_store_rx))
        .launch_async("block_store", texec)?;

    Ok(Pipeline {
        to_process: to_process_tx,
        tracker,
        shared,
        flush,
    })
}

/// Calls the engine, retrying only transient unavailability.
pub(crate) async fn exec_with_retry<E: ExecEngine>(
    engine: &E,
    backoff: &ExponentialBackoff,
    req: BlockExecRequest,
) -> Result<BlockExecOutput, EngineError> {
    retry_with_backoff_async(
        "engine_execute_block",
        DEFAULT_ENGINE_CALL_MAX_RETRIES,
        backoff,
        || {
            let req = req.clone();
            async move {
                match engine.execute_block(req).await {
                    Err(e) if e.is_retryable() => Err(e),
                    other => Ok(other),
                }
            }
        },
    )
    .await
    .and_then(|res| res)
}

/// The engine's response must line up with what was submitted.
pub(crate) fn check_block_response(
    block: &WipBlock,
    exec: &BlockExecOutput,
) -> FinalizerResult<()> {
    if exec.tx_results.len() != block.txs.len() {
        return Err(FinalizerError::ResponseMismatch(format!(
            "submitted {} txs, engine answered {}",
            block.txs.len(),
            exec.tx_results.len()
        )));
    }

    for (i, (submitted, result)) in block.txs.iter().zip(&exec.tx_results).enumerate() {
        if submitted.hash != result.hash {
            return Err(FinalizerError::ResponseMismatch(format!(
                "tx {} hash mismatch: submitted {:?}, answered {:?}",
                i, submitted.hash, result.hash
            )));
        }
    }

    if exec.timestamp != block.timestamp {
        return Err(FinalizerError::ResponseMismatch(format!(
            "timestamp mismatch: submitted {}, answered {}",
            block.timestamp, exec.timestamp
        )));
    }

    Ok(())
}

/// Full block context for the post-mortem log on fatal errors.
pub(crate) fn dump_block(block: &WipBlock) {
    error!(
        block = %block.tracking_num,
        batch = %block.batch_number,
        timestamp = block.timestamp,
        delta = block.delta_timestamp,
        txs = block.txs.len(),
        "block dump"
    );
    for (i, tx) in block.txs.iter().enumerate() {
        error!(pos = i, txh = %tx.hash, from = %tx.from, bytes = tx.raw.len(), "block dump tx");
    }
}
