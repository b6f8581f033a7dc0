//! The finalizer control loop.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use moraine_common::retry::{
    retry_with_backoff_async, ExponentialBackoff, DEFAULT_DB_CALL_MAX_RETRIES,
};
use moraine_config::ConfigHandle;
use moraine_db::{
    BatchReceipt, DbError, DbResult, ExitRootUpdate, ForcedBatch, OpenBatchParams, SequencerDb,
    StateReader, StoredBlock, TxPool,
};
use moraine_engine::{
    BlockContext, BlockExecRequest, EngineError, ExecEngine, ExecPayload, TxExecResult,
    TxRejection,
};
use moraine_primitives::{ClosingReason, ExitRoot, StateRoot};
use moraine_service::CommandHandle;
use moraine_signals::ClosingSignalChannels;
use moraine_tasks::{ShutdownGuard, TaskExecutor};
use moraine_worker::{DroppedTx, TxTracker, Worker, WorkerError};
use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::{
    batch::WipBatch,
    block::WipBlock,
    errors::{FinalizerError, FinalizerResult},
    handle::{CtlCommand, FinalizerHandle, FinalizerStatus},
    pipeline::{dump_block, exec_with_retry, spawn_pipeline, Pipeline},
};

/// Buffer of the admin control channel.
const CTL_CHANNEL_SIZE: usize = 8;

/// How often the expiry sweep runs.
const EXPIRY_SWEEP_SECS: u64 = 60;

/// Requested pause condition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum StopMode {
    AfterCurrentBatch,
    AtBatch(u64),
}

/// The batch/sub-block lifecycle state machine.
///
/// Single control flow: only this loop mutates the WIP batch/block and the
/// immediate resource budget. Execution and persistence run behind the
/// pipeline; batch closure waits for it to drain.
pub struct Finalizer<E, D, P, S> {
    config: ConfigHandle,
    engine: Arc<E>,
    db: Arc<D>,
    pool: Arc<P>,
    worker: Arc<Worker<S>>,
    signals: ClosingSignalChannels,
    ctl_rx: mpsc::Receiver<CtlCommand>,
    status_tx: watch::Sender<FinalizerStatus>,
    pipeline: Pipeline,
    backoff: ExponentialBackoff,

    wip_batch: WipBatch,
    wip_block: WipBlock,
    block_counter: u64,

    buffered_forced: Vec<ForcedBatch>,
    forced_deadline: Option<u64>,
    pending_exit_root: Option<ExitRootUpdate>,
    exit_root_deadline: Option<u64>,
    l1_timeout: bool,

    stop: Option<StopMode>,
    paused: bool,
    last_closing_reason: ClosingReason,
    last_expiry_sweep: u64,
}

impl<E, D, P, S> std::fmt::Debug for Finalizer<E, D, P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("batch", &self.wip_batch.number)
            .field("block", &self.wip_block.tracking_num)
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_secs()
}

impl<E, D, P, S> Finalizer<E, D, P, S>
where
    E: ExecEngine,
    D: SequencerDb,
    P: TxPool,
    S: StateReader,
{
    /// Spawns the pipeline and the control loop; returns the admin handle.
    pub fn start(
        config: ConfigHandle,
        engine: Arc<E>,
        db: Arc<D>,
        pool: Arc<P>,
        worker: Arc<Worker<S>>,
        signals: ClosingSignalChannels,
        texec: &TaskExecutor,
    ) -> anyhow::Result<FinalizerHandle> {
        let coinbase = config.snapshot().coinbase;
        let pipeline = spawn_pipeline(
            texec,
            engine.clone(),
            db.clone(),
            pool.clone(),
            worker.clone(),
            config.clone(),
            coinbase,
        )?;

        let (ctl_tx, ctl_rx) = mpsc::channel(CTL_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(FinalizerStatus::default());
        let handle = FinalizerHandle::new(CommandHandle::new(ctl_tx), status_rx);

        let now = unix_now();
        let finalizer = Self {
            config,
            engine,
            db,
            pool,
            worker,
            signals,
            ctl_rx,
            status_tx,
            pipeline,
            backoff: ExponentialBackoff::default(),
            // Placeholders until the state sync at startup.
            wip_batch: WipBatch::open(
                0,
                coinbase,
                now,
                StateRoot::zero(),
                ExitRoot::zero(),
                &Default::default(),
            ),
            wip_block: WipBlock::new(0, 0, now, now, None),
            block_counter: 0,
            buffered_forced: Vec::new(),
            forced_deadline: None,
            pending_exit_root: None,
            exit_root_deadline: None,
            l1_timeout: false,
            stop: None,
            paused: false,
            last_closing_reason: ClosingReason::StillOpen,
            last_expiry_sweep: now,
        };

        texec.spawn_critical_async_with_shutdown("finalizer", move |guard| finalizer.run(guard));
        Ok(handle)
    }

    async fn run(mut self, guard: ShutdownGuard) -> anyhow::Result<()> {
        match self.run_inner(&guard).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_interruption() => {
                info!("finalizer stopping on shutdown");
                Ok(())
            }
            Err(e) => {
                // Fatal: full context before the process goes down.
                error!(
                    batch = %self.wip_batch.number,
                    block = %self.wip_block.tracking_num,
                    %e,
                    "halting finalizer"
                );
                dump_block(&self.wip_block);
                Err(e.into())
            }
        }
    }

    async fn run_inner(&mut self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        self.sync_to_state(guard).await?;
        info!(batch = %self.wip_batch.number, root = %self.wip_batch.state_root, "finalizer loop starting");

        loop {
            if guard.should_shutdown() {
                return Ok(());
            }

            self.drain_ctl();
            self.drain_signals()?;

            if self.paused {
                self.publish_status();
                self.wait_while_paused(guard).await?;
                continue;
            }

            match self.worker.get_best_fitting_tx(&self.wip_batch.remaining) {
                Ok(tracker) => self.process_transaction(tracker).await?,
                Err(WorkerError::NoReadyTxs) | Err(WorkerError::NoFittingTx) => {
                    self.wait_for_ready(guard).await;
                }
                Err(e) => {
                    // Selection takes no locks beyond the worker's own.
                    warn!(%e, "unexpected selection error");
                }
            }

            let cfg = self.config.snapshot();
            let now = unix_now();

            // Sub-block cadence: ship the block once its period elapsed.
            if !self.wip_block.is_empty()
                && self.wip_block.past_deadline(cfg.finalizer.block_period_secs, now)
            {
                self.submit_wip_block(guard).await?;
            }

            if let Some(reason) = self.batch_close_reason(&cfg, now) {
                info!(batch = %self.wip_batch.number, %reason, "closing batch");
                self.close_and_open_new_batch(reason, guard).await?;
            }

            self.maybe_expire_txs(&cfg, now).await;
            self.publish_status();
        }
    }

    // -- startup --

    /// Adopts the persisted WIP batch or opens a fresh one on the last
    /// closed state.
    async fn sync_to_state(&mut self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        self.wait_synced(guard).await?;
        let cfg = self.config.snapshot();

        if let Some(record) = self.with_db_retry("wip_batch", || self.db.wip_batch()).await? {
            info!(batch = %record.number, blocks = %record.block_count, "resuming WIP batch");
            let wip = WipBatch::resume(&record, &cfg.constraints)?;
            self.pipeline.shared.reset(record.state_root, wip.remaining);
            self.block_counter = record.block_count;
            self.wip_batch = wip;
        } else {
            let last = self
                .with_db_retry("last_batch_number", || self.db.last_batch_number())
                .await?;
            let root = if last > 0 {
                self.with_db_retry("batch_state_root", || self.db.batch_state_root(last))
                    .await?
            } else {
                StateRoot::zero()
            };

            let head = self.with_db_retry("l1_head_block", || self.db.l1_head_block()).await?;
            let max_block = head.saturating_sub(cfg.pollers.exit_root_l1_confirmations);
            let exit_root = self
                .with_db_retry("latest_exit_root", || self.db.latest_exit_root(max_block))
                .await?
                .map(|u| u.root)
                .unwrap_or(ExitRoot::zero());

            let number = last + 1;
            let now = unix_now();
            info!(batch = %number, %root, "opening first batch");
            self.with_db_retry("open_batch", || {
                self.db.open_batch(OpenBatchParams {
                    number,
                    coinbase: cfg.coinbase,
                    timestamp: now,
                    exit_root,
                    forced_batch_number: None,
                })
            })
            .await?;

            self.wip_batch =
                WipBatch::open(number, cfg.coinbase, now, root, exit_root, &cfg.constraints);
            self.pipeline
                .shared
                .reset(root, cfg.constraints.as_resources());
        }

        self.open_new_wip_block(self.wip_batch.timestamp);
        self.publish_status();
        Ok(())
    }

    async fn wait_synced(&self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        loop {
            match self.db.is_synced().await {
                Ok(true) => return Ok(()),
                Ok(false) => info!("waiting for synchronizer to catch up"),
                Err(e) => warn!(%e, "failed to read sync status"),
            }
            tokio::select! {
                _ = guard.wait_for_shutdown() => return Err(FinalizerError::Interrupted),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    // -- inputs --

    fn drain_ctl(&mut self) {
        while let Ok(cmd) = self.ctl_rx.try_recv() {
            self.apply_ctl(cmd);
        }
    }

    fn apply_ctl(&mut self, cmd: CtlCommand) {
        match cmd {
            CtlCommand::StopAfterCurrentBatch { ack } => {
                info!("stop requested after current batch");
                self.stop = Some(StopMode::AfterCurrentBatch);
                let _ = ack.send(());
            }
            CtlCommand::StopAtBatch { batch, ack } => {
                info!(%batch, "stop requested at batch");
                self.stop = Some(StopMode::AtBatch(batch));
                let _ = ack.send(());
            }
            CtlCommand::Resume { ack } => {
                info!("resume requested");
                self.stop = None;
                self.paused = false;
                let _ = ack.send(());
            }
        }
    }

    fn drain_signals(&mut self) -> FinalizerResult<()> {
        let now = unix_now();
        let cfg = self.config.snapshot();

        // A reorg invalidates everything in flight: discard the WIP batch
        // by halting; the restart path re-syncs before opening anything.
        if let Ok(signal) = self.signals.reorg_rx.try_recv() {
            error!(
                local = %signal.local_root,
                observed = %signal.observed_root,
                "L2 reorg detected, discarding WIP batch"
            );
            return Err(FinalizerError::ReorgDetected {
                local: signal.local_root,
                observed: signal.observed_root,
            });
        }

        while let Ok(fb) = self.signals.forced_rx.try_recv() {
            debug!(forced = %fb.number, "buffering forced batch");
            self.buffered_forced.push(fb);
            self.buffered_forced.sort_by_key(|fb| fb.number);
            if self.forced_deadline.is_none() {
                self.forced_deadline = Some(now + cfg.finalizer.forced_batch_deadline_secs);
            }
        }

        while let Ok(update) = self.signals.exit_root_rx.try_recv() {
            debug!(root = %update.root, "buffering exit root update");
            self.pending_exit_root = Some(update);
            if self.exit_root_deadline.is_none() {
                self.exit_root_deadline = Some(now + cfg.finalizer.exit_root_deadline_secs);
            }
        }

        while let Ok(signal) = self.signals.timeout_rx.try_recv() {
            debug!(silent_for = signal.silent_for_secs, "L1 silence timeout received");
            self.l1_timeout = true;
        }

        Ok(())
    }

    async fn wait_while_paused(&mut self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        tokio::select! {
            _ = guard.wait_for_shutdown() => Err(FinalizerError::Interrupted),
            cmd = self.ctl_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        self.apply_ctl(cmd);
                        Ok(())
                    }
                    // Handle dropped; nothing can ever resume us.
                    None => Err(FinalizerError::Interrupted),
                }
            }
        }
    }

    async fn wait_for_ready(&self, guard: &ShutdownGuard) {
        let wait = Duration::from_millis(self.config.snapshot().finalizer.new_tx_wait_ms);
        let notify = self.worker.ready_signal();
        tokio::select! {
            _ = guard.wait_for_shutdown() => {}
            _ = notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    // -- transaction processing --

    /// Trial-executes one selected transaction and commits it into the WIP
    /// block if it fits.
    async fn process_transaction(&mut self, tracker: TxTracker) -> FinalizerResult<()> {
        let req = BlockExecRequest {
            context: BlockContext {
                batch_number: self.wip_batch.number,
                coinbase: self.wip_batch.coinbase,
                timestamp: self.wip_block.timestamp,
                delta_timestamp: self.wip_block.delta_timestamp,
                exit_root: self.wip_block.exit_root,
            },
            prior_state_root: self.wip_batch.state_root,
            payload: ExecPayload::Txs(vec![moraine_engine::SubmittedTx {
                hash: tracker.hash,
                from: tracker.from,
                raw: tracker.raw.clone(),
            }]),
        };

        let out = match exec_with_retry(self.engine.as_ref(), &self.backoff, req).await {
            Ok(out) => out,
            Err(EngineError::Unavailable(e)) => {
                // Retries exhausted; the tx stays ready and we try again
                // next iteration.
                warn!(txh = %tracker.hash, %e, "engine unavailable, deferring tx");
                return Ok(());
            }
            Err(EngineError::OutOfCounters) => {
                // The tx alone blows a circuit counter: permanently out.
                error!(txh = %tracker.hash, "tx is out of counters, dropping");
                self.worker.delete_tx(&tracker.hash, tracker.from);
                self.mark_invalid(tracker.hash, "out of counters").await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if out.tx_results.len() != 1 || out.tx_results[0].hash != tracker.hash {
            return Err(FinalizerError::ResponseMismatch(format!(
                "single-tx execution answered {} results",
                out.tx_results.len()
            )));
        }
        let result = &out.tx_results[0];

        if let Some(rejection) = result.rejection.clone() {
            self.handle_tx_rejection(&tracker, result, &rejection).await;
            return Ok(());
        }

        // Commit against the immediate budget; actual usage can exceed the
        // estimate the pre-check ran on, in which case the tx is skipped
        // and its footprint corrected for a future batch.
        let mut used = result.used_resources;
        used.bytes = tracker.raw.len() as u64;
        if self.wip_batch.remaining.checked_sub(&used).is_err() {
            info!(
                txh = %tracker.hash,
                "tx exceeds the remaining batch budget, fixing its footprint estimate"
            );
            self.worker
                .update_tx_resources(&tracker.hash, tracker.from, used);
            return Ok(());
        }

        self.wip_batch.state_root = out.new_state_root;
        self.wip_batch.local_exit_root = out.new_local_exit_root;
        self.wip_batch.tx_count += 1;
        self.wip_block.add_tx(&tracker);
        self.wip_block.used.sum_up(&used);

        debug!(
            txh = %tracker.hash,
            batch = %self.wip_batch.number,
            block = %self.wip_block.tracking_num,
            root = %out.new_state_root,
            "tx admitted into block"
        );

        // Pin the sender's queue for the store stage before the tracker
        // itself goes away, then propagate account effects.
        self.worker.add_pending_tx_to_store(tracker.hash, tracker.from);
        self.worker.delete_tx(&tracker.hash, tracker.from);
        let dropped = self
            .worker
            .update_after_successful_execution(tracker.from, &result.touched);
        self.report_dropped(dropped).await;

        Ok(())
    }

    async fn handle_tx_rejection(
        &mut self,
        tracker: &TxTracker,
        result: &TxExecResult,
        rejection: &TxRejection,
    ) {
        match rejection {
            TxRejection::InvalidNonce | TxRejection::InsufficientBalance => {
                let update = result.touched.get(&tracker.from);
                info!(
                    txh = %tracker.hash,
                    ?rejection,
                    "intrinsic failure, moving tx to not-ready"
                );
                let dropped = self.worker.move_tx_to_not_ready(
                    &tracker.hash,
                    tracker.from,
                    update.and_then(|u| u.nonce),
                    update.and_then(|u| u.balance),
                );
                self.report_dropped(dropped).await;
            }
            TxRejection::OutOfCounters => {
                error!(txh = %tracker.hash, "tx out of counters, marking invalid");
                self.worker.delete_tx(&tracker.hash, tracker.from);
                self.mark_invalid(tracker.hash, "out of counters").await;
            }
            TxRejection::Invalid(reason) => {
                info!(txh = %tracker.hash, %reason, "tx rejected, dropping");
                self.worker.delete_tx(&tracker.hash, tracker.from);
                if let Err(e) = self.pool.mark_failed(tracker.hash, reason).await {
                    warn!(txh = %tracker.hash, %e, "failed to update pool status");
                }
            }
        }
    }

    async fn report_dropped(&self, dropped: Vec<DroppedTx>) {
        for tx in dropped {
            if let Err(e) = self.pool.mark_failed(tx.hash, &tx.reason).await {
                warn!(txh = %tx.hash, %e, "failed to update pool status");
            }
        }
    }

    async fn mark_invalid(&self, hash: moraine_primitives::TxHash, reason: &str) {
        if let Err(e) = self.pool.mark_invalid(hash, reason).await {
            warn!(txh = %hash, %e, "failed to update pool status");
        }
    }

    // -- block and batch lifecycle --

    /// Ships the current WIP block into the pipeline and opens the next
    /// one.
    async fn submit_wip_block(&mut self, guard: &ShutdownGuard) -> FinalizerResult<()> {
        let prev_timestamp = self.wip_block.timestamp;
        let next = self.next_wip_block(self.wip_batch.number, prev_timestamp, None);
        let block = std::mem::replace(&mut self.wip_block, next);

        debug!(
            block = %block.tracking_num,
            batch = %block.batch_number,
            txs = block.txs.len(),
            bytes = block.used.bytes,
            "submitting block to pipeline"
        );

        // Every tx in the block was pinned pending-store at commit time.
        self.wip_batch.block_count += 1;
        self.pipeline.tracker.submitted();

        let unpin: Vec<_> = block.txs.iter().map(|tx| (tx.hash, tx.from)).collect();
        tokio::select! {
            _ = guard.wait_for_shutdown() => {
                self.pipeline.tracker.stored();
                for (hash, from) in unpin {
                    self.worker.delete_pending_tx_to_store(&hash, from);
                }
                Err(FinalizerError::Interrupted)
            }
            res = self.pipeline.to_process.send(block) => {
                if res.is_err() {
                    // Pipeline gone; only happens during teardown.
                    self.pipeline.tracker.stored();
                    return Err(FinalizerError::Interrupted);
                }
                Ok(())
            }
        }
    }

    fn next_wip_block(
        &mut self,
        batch_number: u64,
        prev_timestamp: u64,
        exit_root: Option<ExitRoot>,
    ) -> WipBlock {
        self.block_counter += 1;
        WipBlock::new(
            self.block_counter,
            batch_number,
            prev_timestamp,
            unix_now(),
            exit_root,
        )
    }

    fn open_new_wip_block(&mut self, prev_timestamp: u64) {
        // The first block of a batch carries the batch's exit root so the
        // engine incorporates it exactly once.
        let exit_root = (self.wip_batch.block_count == 0
            && !self.wip_batch.exit_root.is_zero())
        .then_some(self.wip_batch.exit_root);
        self.wip_block = self.next_wip_block(self.wip_batch.number, prev_timestamp, exit_root);
    }

    fn batch_close_reason(
        &mut self,
        cfg: &moraine_config::Config,
        now: u64,
    ) -> Option<ClosingReason> {
        if self.forced_deadline.is_some_and(|d| now >= d) {
            return Some(ClosingReason::ForcedBatchDeadline);
        }
        if self.exit_root_deadline.is_some_and(|d| now >= d) {
            return Some(ClosingReason::ExitRootDeadline);
        }
        if self.l1_timeout && !self.wip_batch.is_empty() {
            return Some(ClosingReason::L1Timeout);
        }
        if !self.wip_batch.is_empty()
            && now >= self.wip_batch.timestamp + cfg.finalizer.timestamp_resolution_secs
        {
            return Some(ClosingReason::TimestampDeadline);
        }
        if self.wip_batch.tx_count >= cfg.constraints.max_txs_per_batch {
            return Some(ClosingReason::Full);
        }
        if let Some(dimension) = self
            .wip_batch
            .under_threshold(&cfg.constraints, cfg.finalizer.resource_percentage_to_close)
        {
            info!(batch = %self.wip_batch.number, %dimension, "batch under close threshold");
            return Some(ClosingReason::AlmostFull);
        }
        None
    }

    /// Closes the batch: ship the open sub-block, drain the pipeline,
    /// enforce root advancement, close in the store, interleave forced
    /// batches, open the next batch.
    async fn close_and_open_new_batch(
        &mut self,
        reason: ClosingReason,
        guard: &ShutdownGuard,
    ) -> FinalizerResult<()> {
        let cfg = self.config.snapshot();
        self.wip_batch.closing_reason = reason;

        // Sub-block closure first, always; an empty block still takes one
        // execution pass in the pipeline to advance the root.
        self.submit_wip_block(guard).await?;
        self.pipeline.tracker.wait_idle(guard).await?;

        let mut view = self.pipeline.shared.get();

        // A batch whose root never moved can't be closed; force exactly
        // one more empty pass before giving up.
        if view.state_root == self.wip_batch.initial_state_root {
            info!(
                batch = %self.wip_batch.number,
                "state root did not advance, forcing one reprocessing pass"
            );
            self.submit_wip_block(guard).await?;
            self.pipeline.tracker.wait_idle(guard).await?;
            view = self.pipeline.shared.get();
        }

        let used = cfg.constraints.used(&view.remaining);
        let receipt = BatchReceipt {
            number: self.wip_batch.number,
            state_root: view.state_root,
            local_exit_root: view.local_exit_root,
            used_resources: used,
            closing_reason: reason,
        };
        self.with_db_retry("close_batch", || self.db.close_batch(receipt.clone()))
            .await?;
        let closed_number = self.wip_batch.number;
        self.last_closing_reason = reason;
        info!(batch = %closed_number, root = %view.state_root, %reason, "batch closed");

        // Forced batches go in right here, before the next normal batch.
        let (last_number, root) = self
            .process_forced_batches(closed_number, view.state_root, guard)
            .await?;

        // Incorporate a pending exit-root update into the next batch.
        let exit_root = match self.pending_exit_root.take() {
            Some(update) => update.root,
            None => self.wip_batch.exit_root,
        };
        self.exit_root_deadline = None;
        self.l1_timeout = false;

        let number = last_number + 1;
        let now = unix_now();
        self.with_db_retry("open_batch", || {
            self.db.open_batch(OpenBatchParams {
                number,
                coinbase: cfg.coinbase,
                timestamp: now,
                exit_root,
                forced_batch_number: None,
            })
        })
        .await?;
        self.wait_synced(guard).await?;

        let prev_block_timestamp = self.wip_block.timestamp;
        self.wip_batch =
            WipBatch::open(number, cfg.coinbase, now, root, exit_root, &cfg.constraints);
        self.pipeline
            .shared
            .reset(root, cfg.constraints.as_resources());
        self.open_new_wip_block(prev_block_timestamp);
        info!(batch = %number, %root, "new WIP batch open");

        // Administrative stops take effect exactly here.
        let cfg_stop = cfg.finalizer.stop_on_batch.is_some_and(|n| closed_number >= n);
        let requested_stop = match self.stop {
            Some(StopMode::AfterCurrentBatch) => true,
            Some(StopMode::AtBatch(n)) => closed_number >= n,
            None => false,
        };
        if cfg_stop || requested_stop {
            info!(batch = %closed_number, "pausing after batch boundary");
            self.paused = true;
        }

        self.publish_status();
        Ok(())
    }

    // -- forced batches --

    /// Applies buffered forced batches in strict ascending sequence with
    /// no gaps, fetching any locally missing entry from the store.
    async fn process_forced_batches(
        &mut self,
        mut last_number: u64,
        mut root: StateRoot,
        guard: &ShutdownGuard,
    ) -> FinalizerResult<(u64, StateRoot)> {
        self.forced_deadline = None;
        if self.buffered_forced.is_empty() {
            return Ok((last_number, root));
        }

        let last_trusted = self
            .with_db_retry("last_trusted_forced_batch_number", || {
                self.db.last_trusted_forced_batch_number()
            })
            .await?;
        let mut next_forced = last_trusted + 1;

        let buffered = std::mem::take(&mut self.buffered_forced);
        for fb in &buffered {
            // Already materialized by an earlier close.
            if fb.number < next_forced {
                continue;
            }

            // Fill any gap from the store before this one.
            while fb.number > next_forced {
                let missing = self
                    .with_db_retry("forced_batch", || self.db.forced_batch(next_forced))
                    .await?;
                (last_number, root) = self
                    .process_forced_batch(&missing, last_number, root, guard)
                    .await?;
                next_forced += 1;
            }

            (last_number, root) = self
                .process_forced_batch(fb, last_number, root, guard)
                .await?;
            next_forced += 1;
        }

        Ok((last_number, root))
    }

    /// Materializes one forced batch as its own closed batch.
    async fn process_forced_batch(
        &mut self,
        fb: &ForcedBatch,
        last_number: u64,
        root: StateRoot,
        guard: &ShutdownGuard,
    ) -> FinalizerResult<(u64, StateRoot)> {
        let number = last_number + 1;
        info!(forced = %fb.number, batch = %number, %root, "processing forced batch");

        self.with_db_retry("open_batch", || {
            self.db.open_batch(OpenBatchParams {
                number,
                coinbase: self.config.snapshot().coinbase,
                timestamp: fb.forced_at,
                exit_root: fb.exit_root,
                forced_batch_number: Some(fb.number),
            })
        })
        .await?;

        let req = BlockExecRequest {
            context: BlockContext {
                batch_number: number,
                coinbase: self.config.snapshot().coinbase,
                timestamp: fb.forced_at,
                delta_timestamp: 0,
                exit_root: Some(fb.exit_root),
            },
            prior_state_root: root,
            payload: ExecPayload::Raw(fb.raw_txs.clone()),
        };
        let exec = exec_with_retry(self.engine.as_ref(), &self.backoff, req).await?;

        // Forced batches are stored synchronously; the durability gate
        // still applies.
        self.pipeline.flush.wait_durable(exec.flush_id, guard).await?;

        self.block_counter += 1;
        let stored = StoredBlock {
            batch_number: number,
            tracking_num: self.block_counter,
            timestamp: fb.forced_at,
            delta_timestamp: 0,
            exit_root: Some(fb.exit_root),
            raw_txs: vec![fb.raw_txs.clone()],
            exec: exec.clone(),
        };
        self.with_db_retry("store_block", || self.db.store_block(stored.clone()))
            .await?;

        // Propagate account effects of the forced transactions into the
        // worker, pinning each sender while we do.
        for result in exec.tx_results.iter().filter(|r| r.is_applied()) {
            self.worker.add_forced_tx(result.hash, result.from);
            let dropped = self
                .worker
                .update_after_successful_execution(result.from, &result.touched);
            self.report_dropped(dropped).await;
            self.worker.delete_forced_tx(&result.hash, result.from);
        }

        let receipt = BatchReceipt {
            number,
            state_root: exec.new_state_root,
            local_exit_root: exec.new_local_exit_root,
            used_resources: exec.used_resources,
            closing_reason: ClosingReason::ForcedBatch,
        };
        self.with_db_retry("close_batch", || self.db.close_batch(receipt.clone()))
            .await?;

        info!(forced = %fb.number, batch = %number, root = %exec.new_state_root, "forced batch closed");
        Ok((number, exec.new_state_root))
    }

    // -- housekeeping --

    async fn maybe_expire_txs(&mut self, cfg: &moraine_config::Config, now: u64) {
        if cfg.worker.tx_lifetime_secs == 0 || now < self.last_expiry_sweep + EXPIRY_SWEEP_SECS {
            return;
        }
        self.last_expiry_sweep = now;
        let dropped = self.worker.expire_txs(cfg.worker.tx_lifetime_secs, now);
        self.report_dropped(dropped).await;
    }

    async fn with_db_retry<T, F, Fut>(&self, name: &str, op: F) -> Result<T, DbError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = DbResult<T>>,
    {
        retry_with_backoff_async(name, DEFAULT_DB_CALL_MAX_RETRIES, &self.backoff, || {
            let fut = op();
            async move {
                match fut.await {
                    Err(e) if e.is_retryable() => Err(e),
                    other => Ok(other),
                }
            }
        })
        .await
        .and_then(|res| res)
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(FinalizerStatus {
            batch_number: self.wip_batch.number,
            block_tracking_num: self.wip_block.tracking_num,
            batch_tx_count: self.wip_batch.tx_count,
            paused: self.paused,
            last_closing_reason: self.last_closing_reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use ethnum::U256;
    use moraine_config::Config;
    use moraine_db::{test_utils::MemBackend, PendingTx, TxStatus};
    use moraine_primitives::{Address, BatchResources, TxHash};
    use moraine_signals::{L1SilenceTimeout, L2ReorgSignal};
    use moraine_tasks::TaskManager;
    use moraine_worker::WeightedScorer;
    use tokio::sync::mpsc;

    use super::*;
    use crate::test_utils::{OfflineEngine, SimEngine, SIM_INSTANCE};

    fn addr(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn hash(byte: u8) -> TxHash {
        TxHash::new([byte; 32])
    }

    fn pending(hash_byte: u8, from: Address, nonce: u64) -> PendingTx {
        PendingTx {
            hash: hash(hash_byte),
            from,
            nonce,
            gas: 21_000,
            gas_price: U256::from(10u64),
            cost: U256::from(5u64),
            raw: vec![hash_byte; 16],
            reserved_resources: BatchResources::default(),
            received_at: unix_now(),
            submitter: None,
        }
    }

    /// Config tuned so tests converge in milliseconds of real time.
    fn fast_config(timestamp_resolution_secs: u64) -> Config {
        let mut config = Config::default();
        config.coinbase = addr(0xc0);
        config.finalizer.new_tx_wait_ms = 5;
        config.finalizer.block_period_secs = 0;
        config.finalizer.timestamp_resolution_secs = timestamp_resolution_secs;
        config.finalizer.exit_root_deadline_secs = 0;
        config.finalizer.forced_batch_deadline_secs = 0;
        config.finalizer.flush_id_poll_ms = 10;
        config
    }

    struct TestRig<E> {
        backend: Arc<MemBackend>,
        #[allow(dead_code)]
        engine: Arc<E>,
        worker: Arc<Worker<MemBackend>>,
        handle: FinalizerHandle,
        manager: TaskManager,
        forced_tx: mpsc::Sender<ForcedBatch>,
        exit_root_tx: mpsc::Sender<ExitRootUpdate>,
        #[allow(dead_code)]
        timeout_tx: mpsc::Sender<L1SilenceTimeout>,
        reorg_tx: mpsc::Sender<L2ReorgSignal>,
    }

    impl<E: ExecEngine> TestRig<E> {
        fn start(config: Config, engine: Arc<E>, backend: Arc<MemBackend>) -> Self {
            let manager = TaskManager::new(tokio::runtime::Handle::current());
            let texec = manager.executor();
            let config = ConfigHandle::new(config);

            let constraints = config.snapshot().constraints;
            let scorer = Arc::new(WeightedScorer::new(
                constraints,
                &config.snapshot().worker.weights,
                1.0,
            ));
            let worker = Arc::new(Worker::new(backend.clone(), constraints, scorer));

            let (forced_tx, forced_rx) = mpsc::channel(16);
            let (exit_root_tx, exit_root_rx) = mpsc::channel(16);
            let (timeout_tx, timeout_rx) = mpsc::channel(16);
            let (reorg_tx, reorg_rx) = mpsc::channel(16);
            let signals = ClosingSignalChannels {
                forced_rx,
                exit_root_rx,
                timeout_rx,
                reorg_rx,
            };

            let handle = Finalizer::start(
                config,
                engine.clone(),
                backend.clone(),
                backend.clone(),
                worker.clone(),
                signals,
                &texec,
            )
            .expect("finalizer should start");

            Self {
                backend,
                engine,
                worker,
                handle,
                manager,
                forced_tx,
                exit_root_tx,
                timeout_tx,
                reorg_tx,
            }
        }

        async fn shutdown(self) {
            self.manager.shutdown_signal().send();
            tokio::time::timeout(Duration::from_secs(30), self.manager.monitor())
                .await
                .expect("drain should complete");
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn sim_rig(config: Config) -> (TestRig<SimEngine>, Arc<SimEngine>, Arc<MemBackend>) {
        let backend = Arc::new(MemBackend::new());
        let engine = Arc::new(SimEngine::new(backend.clone()));
        let rig = TestRig::start(config, engine.clone(), backend.clone());
        (rig, engine, backend)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tx_flows_into_stored_closed_batch() {
        let (rig, _engine, backend) = sim_rig(fast_config(0));
        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));

        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        let b = backend.clone();
        wait_until("batch 1 to close", move || b.batch_receipt(1).is_some()).await;

        assert!(backend.batch_block_count(1) >= 1);
        assert_eq!(backend.pool_status(&hash(1)), Some(TxStatus::Selected));
        assert_eq!(
            backend.batch_receipt(1).unwrap().closing_reason,
            ClosingReason::TimestampDeadline
        );
        // The next batch is already open.
        wait_until("next batch status", || rig.handle.status().batch_number >= 2).await;

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unchanged_root_forces_one_reprocess_pass() {
        // Engine that never advances the root on empty blocks, batch
        // closed by an exit-root deadline while still empty.
        let backend = Arc::new(MemBackend::new());
        let engine =
            Arc::new(SimEngine::new(backend.clone()).with_advance_root_on_empty(false));
        let rig = TestRig::start(fast_config(1_000_000), engine.clone(), backend.clone());

        rig.exit_root_tx
            .send(ExitRootUpdate {
                root: ExitRoot::new([7; 32]),
                l1_block: 5,
                timestamp: 1,
            })
            .await
            .unwrap();

        let b = backend.clone();
        wait_until("batch 1 to close", move || b.batch_receipt(1).is_some()).await;

        let receipt = backend.batch_receipt(1).unwrap();
        assert_eq!(receipt.closing_reason, ClosingReason::ExitRootDeadline);
        // One regular close pass plus exactly one forced reprocess pass.
        assert_eq!(backend.batch_block_count(1), 2);
        assert_eq!(engine.empty_exec_calls(), 2);

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forced_batches_applied_gapless_in_order() {
        let (rig, _engine, backend) = sim_rig(fast_config(1_000_000));
        backend.set_last_trusted_forced(4);
        // The store has every forced batch; only 5 and 7 are delivered as
        // signals, so 6 must be fetch-filled.
        for n in [5u64, 6, 7] {
            backend.push_forced_batch(ForcedBatch {
                number: n,
                l1_block: 10,
                exit_root: ExitRoot::new([n as u8; 32]),
                raw_txs: vec![n as u8; 8],
                forced_at: 100,
            });
        }

        // Delivered out of order: 7 before 5.
        for n in [7u64, 5] {
            rig.forced_tx
                .send(ForcedBatch {
                    number: n,
                    l1_block: 10,
                    exit_root: ExitRoot::new([n as u8; 32]),
                    raw_txs: vec![n as u8; 8],
                    forced_at: 100,
                })
                .await
                .unwrap();
        }

        let b = backend.clone();
        wait_until("forced batches to apply", move || {
            b.batch_receipt(4).is_some()
        })
        .await;

        // Batch 1 closed on the forced deadline, then 5, 6, 7 as batches
        // 2, 3, 4 in strict sequence.
        assert_eq!(
            backend.batch_receipt(1).unwrap().closing_reason,
            ClosingReason::ForcedBatchDeadline
        );
        assert_eq!(backend.batch_forced_number(2), Some(5));
        assert_eq!(backend.batch_forced_number(3), Some(6));
        assert_eq!(backend.batch_forced_number(4), Some(7));
        for n in [2u64, 3, 4] {
            assert_eq!(
                backend.batch_receipt(n).unwrap().closing_reason,
                ClosingReason::ForcedBatch
            );
        }
        wait_until("next normal batch", || rig.handle.status().batch_number >= 5).await;

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_waits_for_durable_flush_id() {
        let backend = Arc::new(MemBackend::new());
        let engine = Arc::new(SimEngine::new(backend.clone()).with_auto_durable(false));
        let rig = TestRig::start(fast_config(0), engine.clone(), backend.clone());

        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        // The block gets executed but must not be stored yet.
        let e = engine.clone();
        wait_until("block execution", move || e.exec_calls() >= 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.batch_block_count(1), 0);
        assert_eq!(backend.pool_status(&hash(1)), Some(TxStatus::Pending));

        // Confirm durability; storage and batch closure proceed.
        backend.set_durable_flush(engine.last_flush_id(), SIM_INSTANCE);
        let b = backend.clone();
        wait_until("block storage", move || b.batch_block_count(1) >= 1).await;
        assert_eq!(backend.pool_status(&hash(1)), Some(TxStatus::Selected));

        // Later flush ids unblock the close's empty block too.
        let b = backend.clone();
        let e = engine.clone();
        wait_until("batch close", move || {
            b.set_durable_flush(e.last_flush_id(), SIM_INSTANCE);
            b.batch_receipt(1).is_some()
        })
        .await;

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_admin_stop_and_resume_at_batch_boundary() {
        let (rig, _engine, backend) = sim_rig(fast_config(0));
        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));

        rig.handle.stop_after_current_batch().await.unwrap();
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        // Batch 1 closes, then the loop pauses with batch 2 open.
        wait_until("pause", || rig.handle.status().paused).await;
        assert!(backend.batch_receipt(1).is_some());
        assert_eq!(rig.handle.status().batch_number, 2);

        // While paused, new work is not picked up. (The sim state reader
        // still reports nonce 0, the previous queue is gone by now.)
        rig.worker.add_tx(pending(2, sender, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.batch_receipt(2).is_none());

        rig.handle.resume().await.unwrap();
        let b = backend.clone();
        wait_until("batch 2 to close", move || b.batch_receipt(2).is_some()).await;
        assert!(!rig.handle.status().paused);

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resumes_persisted_wip_batch() {
        let backend = Arc::new(MemBackend::new());
        // A WIP batch left over from a previous run.
        backend
            .open_batch(OpenBatchParams {
                number: 9,
                coinbase: addr(0xc0),
                timestamp: unix_now(),
                exit_root: ExitRoot::zero(),
                forced_batch_number: None,
            })
            .await
            .unwrap();

        let engine = Arc::new(SimEngine::new(backend.clone()));
        let rig = TestRig::start(fast_config(0), engine, backend.clone());
        wait_until("resume", || rig.handle.status().batch_number == 9).await;

        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        let b = backend.clone();
        wait_until("batch 9 to close", move || b.batch_receipt(9).is_some()).await;

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_response_mismatch_halts() {
        let backend = Arc::new(MemBackend::new());
        let engine = Arc::new(SimEngine::new(backend.clone()).with_corrupt_tx_hashes(true));
        let rig = TestRig::start(fast_config(0), engine, backend.clone());

        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        // The mismatched response is fatal: the finalizer halts and takes
        // the whole task group down.
        tokio::time::timeout(Duration::from_secs(10), rig.manager.monitor())
            .await
            .expect("halt should trigger shutdown");
        assert!(backend.batch_receipt(1).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_unavailability_defers_tx() {
        let backend = Arc::new(MemBackend::new());
        let rig = TestRig::start(fast_config(0), Arc::new(OfflineEngine), backend.clone());

        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // The tx is still queued and nothing advanced.
        assert_eq!(rig.worker.ready_count(), 1);
        assert!(backend.batch_receipt(1).is_none());

        rig.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reorg_signal_discards_wip_and_halts() {
        let (rig, _engine, backend) = sim_rig(fast_config(1_000_000));
        let sender = addr(1);
        backend.set_account(sender, 0, U256::from(100u64));
        rig.worker.add_tx(pending(1, sender, 0)).await.unwrap();

        rig.reorg_tx
            .send(L2ReorgSignal {
                local_root: StateRoot::new([1; 32]),
                observed_root: StateRoot::new([2; 32]),
            })
            .await
            .unwrap();

        // Recovery is a halt: everything winds down, nothing was closed.
        tokio::time::timeout(Duration::from_secs(10), rig.manager.monitor())
            .await
            .expect("reorg should trigger shutdown");
        assert!(backend.batch_receipt(1).is_none());
    }
}
