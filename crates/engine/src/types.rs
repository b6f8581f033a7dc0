//! Request/response types for the execution engine.

use std::collections::HashMap;

use ethnum::U256;
use moraine_primitives::{Address, BatchResources, ExitRoot, StateRoot, TxHash};

/// Batch-level context attached to every execution call.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub batch_number: u64,
    pub coinbase: Address,

    /// Timestamp limit for the block being executed.
    pub timestamp: u64,

    /// Seconds elapsed since the previous block in the batch.
    pub delta_timestamp: u32,

    /// Exit root to incorporate, if it changed since the previous block.
    pub exit_root: Option<ExitRoot>,
}

/// What to execute on top of the prior state root.
#[derive(Debug, Clone)]
pub enum ExecPayload {
    /// An ordered list of known transactions. May be empty: an empty
    /// payload still advances the state root by the block transition
    /// itself.
    Txs(Vec<SubmittedTx>),

    /// An opaque encoded transaction blob, as mandated by a forced batch.
    /// The engine decodes and reports per-tx results.
    Raw(Vec<u8>),
}

impl ExecPayload {
    pub fn empty() -> Self {
        Self::Txs(Vec::new())
    }

    /// Encoded size of the payload in bytes.
    pub fn byte_len(&self) -> u64 {
        match self {
            Self::Txs(txs) => txs.iter().map(|tx| tx.raw.len() as u64).sum(),
            Self::Raw(raw) => raw.len() as u64,
        }
    }
}

/// A transaction submitted for execution.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub hash: TxHash,
    pub from: Address,
    pub raw: Vec<u8>,
}

/// One execution call.
#[derive(Debug, Clone)]
pub struct BlockExecRequest {
    pub context: BlockContext,
    pub prior_state_root: StateRoot,
    pub payload: ExecPayload,
}

/// Nonce/balance changes of one account touched by execution.
///
/// `None` means the field did not change.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub nonce: Option<u64>,
    pub balance: Option<U256>,
}

/// Why the engine refused to apply a transaction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TxRejection {
    /// Nonce didn't match the sender's account state.
    InvalidNonce,

    /// The sender couldn't cover value plus fee.
    InsufficientBalance,

    /// The transaction alone exceeds a circuit counter.
    OutOfCounters,

    /// Any other intrinsic invalidity (malformed payload, bad signature...).
    Invalid(String),
}

/// Per-transaction outcome of an execution call.
#[derive(Debug, Clone)]
pub struct TxExecResult {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,

    /// Resources this transaction consumed.
    pub used_resources: BatchResources,

    /// State root after this transaction.
    pub state_root: StateRoot,

    /// `None` when the transaction was applied and the state root advanced.
    pub rejection: Option<TxRejection>,

    /// Accounts whose nonce/balance changed, the sender included.
    pub touched: HashMap<Address, AccountUpdate>,
}

impl TxExecResult {
    pub fn is_applied(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Outcome of one execution call.
#[derive(Debug, Clone)]
pub struct BlockExecOutput {
    pub new_state_root: StateRoot,
    pub new_local_exit_root: ExitRoot,

    /// One entry per submitted transaction, in submission order.
    pub tx_results: Vec<TxExecResult>,

    /// Resources the call consumed in total.
    pub used_resources: BatchResources,

    /// Upper bound the engine reserved while executing; always >= used.
    pub reserved_resources: BatchResources,

    /// Durability token for this call's execution trace.
    pub flush_id: u64,

    /// Timestamp the engine stamped on the block; must echo the request.
    pub timestamp: u64,
}
