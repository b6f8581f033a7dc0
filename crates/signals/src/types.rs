//! Signal types and delivery channels.

use moraine_db::{ExitRootUpdate, ForcedBatch};
use moraine_primitives::StateRoot;
use tokio::sync::mpsc;

/// Fired when no batch has been virtualized on L1 for longer than the
/// configured bound.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct L1SilenceTimeout {
    /// Timestamp of the last virtualization observed.
    pub last_virtualized_ts: u64,

    /// How long L1 has been silent, in seconds.
    pub silent_for_secs: u64,
}

/// Raised by the synchronizer when the trusted state diverged from what
/// the sequencer produced. The in-flight WIP batch must be discarded and
/// processing must not resume before a re-sync.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct L2ReorgSignal {
    /// Root the sequencer last produced.
    pub local_root: StateRoot,

    /// Root the synchronizer observed instead.
    pub observed_root: StateRoot,
}

/// Sender handed to the synchronizer for reorg notification.
#[derive(Debug, Clone)]
pub struct ReorgNotifier(mpsc::Sender<L2ReorgSignal>);

impl ReorgNotifier {
    pub(crate) fn new(tx: mpsc::Sender<L2ReorgSignal>) -> Self {
        Self(tx)
    }

    /// Delivers a reorg signal. Returns false if the consumer is gone.
    pub async fn notify(&self, signal: L2ReorgSignal) -> bool {
        self.0.send(signal).await.is_ok()
    }
}

/// Consumer ends of the poller channels plus the reorg recovery channel.
#[derive(Debug)]
pub struct ClosingSignalChannels {
    pub forced_rx: mpsc::Receiver<ForcedBatch>,
    pub exit_root_rx: mpsc::Receiver<ExitRootUpdate>,
    pub timeout_rx: mpsc::Receiver<L1SilenceTimeout>,
    pub reorg_rx: mpsc::Receiver<L2ReorgSignal>,
}
