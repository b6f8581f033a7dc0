//! Service builder/launcher infra.

use moraine_tasks::TaskExecutor;
use tokio::sync::watch;

use crate::{async_worker, status::ServiceMonitor, sync_worker, types::*};

/// Assembles a service's state and input and launches the worker on a task
/// executor.
#[derive(Debug)]
pub struct ServiceBuilder<S: Service, I> {
    state: Option<S::State>,
    inp: Option<I>,
}

impl<S: Service, I> ServiceBuilder<S, I> {
    pub fn new() -> Self {
        Self {
            state: None,
            inp: None,
        }
    }

    pub fn with_state(mut self, s: S::State) -> Self {
        self.state = Some(s);
        self
    }

    pub fn with_input(mut self, inp: I) -> Self {
        self.inp = Some(inp);
        self
    }
}

impl<S: Service, I> Default for ServiceBuilder<S, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, I> ServiceBuilder<S, I>
where
    S: AsyncService,
    I: AsyncServiceInput<Msg = S::Msg>,
{
    /// Launches the async service task in an executor.
    pub fn launch_async(
        self,
        name: &'static str,
        texec: &TaskExecutor,
    ) -> anyhow::Result<ServiceMonitor<S>>
    where
        S::Msg: Send,
    {
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("service/builder: missing state"))?;
        let inp = self
            .inp
            .ok_or_else(|| anyhow::anyhow!("service/builder: missing input"))?;

        let init_status = S::get_status(&state);
        let (status_tx, status_rx) = watch::channel(init_status);

        let worker_fut = async_worker::worker_task::<S, I>(state, inp, status_tx);
        texec.spawn_critical_async(name, worker_fut);

        Ok(ServiceMonitor::new(status_rx))
    }
}

impl<S, I> ServiceBuilder<S, I>
where
    S: SyncService,
    I: SyncServiceInput<Msg = S::Msg>,
{
    /// Launches the service thread in an executor.
    pub fn launch_sync(
        self,
        name: &'static str,
        texec: &TaskExecutor,
    ) -> anyhow::Result<ServiceMonitor<S>> {
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("service/builder: missing state"))?;
        let inp = self
            .inp
            .ok_or_else(|| anyhow::anyhow!("service/builder: missing input"))?;

        let init_status = S::get_status(&state);
        let (status_tx, status_rx) = watch::channel(init_status);

        let worker_cls = move |g| sync_worker::worker_task::<S, I>(state, inp, status_tx, g);
        texec.spawn_critical(name, worker_cls);

        Ok(ServiceMonitor::new(status_rx))
    }
}

#[cfg(test)]
mod tests {
    use moraine_tasks::TaskManager;
    use serde::Serialize;
    use tokio::sync::mpsc;

    use super::*;
    use crate::adapters::TokioMpscInput;

    struct CounterState {
        total: u64,
    }

    impl ServiceState for CounterState {
        fn name(&self) -> &str {
            "counter"
        }
    }

    #[derive(Clone, Debug, Serialize)]
    struct CounterStatus {
        total: u64,
    }

    struct CounterService;

    impl Service for CounterService {
        type State = CounterState;
        type Msg = u64;
        type Status = CounterStatus;

        fn get_status(state: &Self::State) -> Self::Status {
            CounterStatus { total: state.total }
        }
    }

    impl AsyncService for CounterService {
        async fn process_input(state: &mut Self::State, input: &u64) -> anyhow::Result<Response> {
            state.total += input;
            Ok(Response::Continue)
        }
    }

    impl SyncService for CounterService {
        fn process_input(state: &mut Self::State, input: &u64) -> anyhow::Result<Response> {
            state.total += input;
            Ok(Response::Continue)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_launch_sync_with_iter_input() {
        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let texec = manager.executor();

        let monitor = ServiceBuilder::<CounterService, _>::new()
            .with_state(CounterState { total: 0 })
            .with_input(crate::adapters::IterInput::new([5u64, 10].into_iter()))
            .launch_sync("counter_sync", &texec)
            .unwrap();

        // The worker drains the iterator on its own thread.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while monitor.get_current().total != 15 {
            assert!(tokio::time::Instant::now() < deadline, "sync worker stalled");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        manager.shutdown_signal().send();
        manager.monitor().await;
    }

    #[tokio::test]
    async fn test_launch_and_process() {
        let manager = TaskManager::new(tokio::runtime::Handle::current());
        let texec = manager.executor();

        let (tx, rx) = mpsc::channel(8);
        let monitor = ServiceBuilder::<CounterService, _>::new()
            .with_state(CounterState { total: 0 })
            .with_input(TokioMpscInput::new(rx))
            .launch_async("counter", &texec)
            .unwrap();

        for v in [1u64, 2, 3] {
            tx.send(v).await.unwrap();
        }
        drop(tx);

        // Worker exits once the channel drains; then the status must be final.
        manager.shutdown_signal().send();
        manager.monitor().await;
        assert_eq!(monitor.get_current().total, 6);
    }
}
