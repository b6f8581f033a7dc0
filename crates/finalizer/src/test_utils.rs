//! Deterministic in-process engine for tests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use moraine_db::test_utils::MemBackend;
use moraine_engine::{
    AccountUpdate, BlockExecOutput, BlockExecRequest, EngineError, EngineResult, ExecEngine,
    ExecPayload, TxExecResult, TxRejection,
};
use moraine_primitives::{
    Address, BatchResources, ExitRoot, StateRoot, TxHash, ZkCounters,
};
use parking_lot::Mutex;

/// Engine instance name reported by the simulator.
pub const SIM_INSTANCE: &str = "sim-engine-1";

#[derive(Debug, Default)]
struct SimState {
    flush_counter: u64,
    root_counter: u64,
    exec_calls: u64,
    empty_exec_calls: u64,
    rejections: HashMap<TxHash, TxRejection>,
    touched: HashMap<TxHash, HashMap<Address, AccountUpdate>>,
}

/// Scripted execution engine.
///
/// Every call advances a deterministic state root and bumps the flush
/// counter. With `auto_durable` the paired [`MemBackend`] immediately
/// confirms each flush id; turn it off to exercise the durability gate.
#[derive(Debug)]
pub struct SimEngine {
    state: Mutex<SimState>,
    backend: Arc<MemBackend>,
    auto_durable: bool,
    advance_root_on_empty: bool,
    corrupt_tx_hashes: bool,
    per_tx_steps: u64,
}

impl SimEngine {
    pub fn new(backend: Arc<MemBackend>) -> Self {
        Self {
            state: Mutex::default(),
            backend,
            auto_durable: true,
            advance_root_on_empty: true,
            corrupt_tx_hashes: false,
            per_tx_steps: 10,
        }
    }

    pub fn with_auto_durable(mut self, auto: bool) -> Self {
        self.auto_durable = auto;
        self
    }

    pub fn with_advance_root_on_empty(mut self, advance: bool) -> Self {
        self.advance_root_on_empty = advance;
        self
    }

    /// Makes every tx result carry a wrong hash, to trip the response
    /// sanity checks.
    pub fn with_corrupt_tx_hashes(mut self, corrupt: bool) -> Self {
        self.corrupt_tx_hashes = corrupt;
        self
    }

    pub fn reject_tx(&self, hash: TxHash, rejection: TxRejection) {
        self.state.lock().rejections.insert(hash, rejection);
    }

    pub fn set_touched(&self, hash: TxHash, touched: HashMap<Address, AccountUpdate>) {
        self.state.lock().touched.insert(hash, touched);
    }

    pub fn exec_calls(&self) -> u64 {
        self.state.lock().exec_calls
    }

    pub fn empty_exec_calls(&self) -> u64 {
        self.state.lock().empty_exec_calls
    }

    pub fn last_flush_id(&self) -> u64 {
        self.state.lock().flush_counter
    }

    fn next_root(counter: u64) -> StateRoot {
        let mut data = [0u8; 32];
        data[..8].copy_from_slice(&counter.to_be_bytes());
        data[31] = 0x5a;
        StateRoot::new(data)
    }
}

#[async_trait]
impl ExecEngine for SimEngine {
    async fn execute_block(&self, req: BlockExecRequest) -> EngineResult<BlockExecOutput> {
        let mut state = self.state.lock();
        state.exec_calls += 1;
        state.flush_counter += 1;
        let flush_id = state.flush_counter;

        let txs = match &req.payload {
            ExecPayload::Txs(txs) => txs.clone(),
            ExecPayload::Raw(raw) => {
                // A forced blob decodes into one synthetic transaction.
                let mut hash = [0u8; 32];
                let n = raw.len().min(32);
                hash[..n].copy_from_slice(&raw[..n]);
                vec![moraine_engine::SubmittedTx {
                    hash: TxHash::new(hash),
                    from: Address::new([0xfe; 20]),
                    raw: raw.clone(),
                }]
            }
        };

        let mut tx_results = Vec::with_capacity(txs.len());
        let mut used = BatchResources::default();
        let mut root = req.prior_state_root;
        let mut any_applied = false;

        for tx in &txs {
            let rejection = state.rejections.get(&tx.hash).cloned();
            let applied = rejection.is_none();

            let tx_used = if applied {
                BatchResources::new(
                    ZkCounters {
                        steps: self.per_tx_steps,
                        cumulative_gas_used: 21_000,
                        ..Default::default()
                    },
                    tx.raw.len() as u64,
                )
            } else {
                BatchResources::default()
            };

            if applied {
                state.root_counter += 1;
                root = Self::next_root(state.root_counter);
                used.sum_up(&tx_used);
                any_applied = true;
            }

            let reported_hash = if self.corrupt_tx_hashes {
                TxHash::new([0xbd; 32])
            } else {
                tx.hash
            };

            tx_results.push(TxExecResult {
                hash: reported_hash,
                from: tx.from,
                nonce: 0,
                used_resources: tx_used,
                state_root: root,
                rejection,
                touched: state.touched.get(&tx.hash).cloned().unwrap_or_default(),
            });
        }

        // The block transition itself moves the root, even with no txs.
        if !any_applied && self.advance_root_on_empty {
            state.root_counter += 1;
            root = Self::next_root(state.root_counter);
        }
        if txs.is_empty() {
            state.empty_exec_calls += 1;
        }

        let mut reserved = used;
        reserved.sum_up(&BatchResources::new(
            ZkCounters {
                steps: 2,
                ..Default::default()
            },
            0,
        ));

        drop(state);

        if self.auto_durable {
            self.backend.set_durable_flush(flush_id, SIM_INSTANCE);
        }

        Ok(BlockExecOutput {
            new_state_root: root,
            new_local_exit_root: ExitRoot::new([0x11; 32]),
            tx_results,
            used_resources: used,
            reserved_resources: reserved,
            flush_id,
            timestamp: req.context.timestamp,
        })
    }

    async fn instance_id(&self) -> EngineResult<String> {
        Ok(SIM_INSTANCE.to_owned())
    }
}

/// An engine that is never reachable, for retry-path tests.
#[derive(Debug, Default)]
pub struct OfflineEngine;

#[async_trait]
impl ExecEngine for OfflineEngine {
    async fn execute_block(&self, _req: BlockExecRequest) -> EngineResult<BlockExecOutput> {
        Err(EngineError::Unavailable("engine offline".into()))
    }

    async fn instance_id(&self) -> EngineResult<String> {
        Err(EngineError::Unavailable("engine offline".into()))
    }
}
