//! Async service worker task.

use tokio::sync::watch;
use tracing::*;

use crate::types::*;

/// Async worker task.
pub(crate) async fn worker_task<S, I>(
    mut state: S::State,
    mut inp: I,
    status_tx: watch::Sender<S::Status>,
) -> anyhow::Result<()>
where
    S: AsyncService,
    I: AsyncServiceInput<Msg = S::Msg>,
{
    let service = state.name().to_owned();

    S::on_launch(&mut state).await?;

    while let Some(input) = inp.recv_next().await? {
        let res = match S::process_input(&mut state, &input).await {
            Ok(res) => res,
            Err(e) => {
                error!(%service, ?input, %e, "failed to process message");
                return Err(e);
            }
        };

        // Update the status.
        let status = S::get_status(&state);
        let _ = status_tx.send(status);

        if res == Response::ShouldExit {
            break;
        }
    }

    debug!(%service, "input closed, worker exiting");
    Ok(())
}
