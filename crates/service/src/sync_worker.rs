//! Blocking service worker task.

use moraine_tasks::ShutdownGuard;
use tokio::sync::watch;
use tracing::*;

use crate::types::*;

/// Blocking worker task, run on a dedicated thread.
pub(crate) fn worker_task<S, I>(
    mut state: S::State,
    mut inp: I,
    status_tx: watch::Sender<S::Status>,
    shutdown: ShutdownGuard,
) -> anyhow::Result<()>
where
    S: SyncService,
    I: SyncServiceInput<Msg = S::Msg>,
{
    let service = state.name().to_owned();

    S::on_launch(&mut state)?;

    while let Some(input) = inp.recv_next()? {
        let res = match S::process_input(&mut state, &input) {
            Ok(res) => res,
            Err(e) => {
                error!(%service, ?input, %e, "failed to process message");
                return Err(e);
            }
        };

        // Update the status.
        let status = S::get_status(&state);
        let _ = status_tx.send(status);

        if res == Response::ShouldExit || shutdown.should_shutdown() {
            break;
        }
    }

    debug!(%service, "input closed, worker exiting");
    Ok(())
}
