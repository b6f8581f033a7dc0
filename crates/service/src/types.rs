//! Service worker common types.

use std::fmt::Debug;

use serde::Serialize;

/// Response from handling an input.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// Normal case, should continue.
    Continue,

    /// Service should exit early.
    ShouldExit,
}

/// Abstract service trait.
pub trait Service {
    /// The in-memory state of the service.
    type State: ServiceState;

    /// The message type the service consumes.
    type Msg: Debug;

    /// The status type derived from the state.
    ///
    /// This implements [`Serialize`] so heterogeneous services can be
    /// surfaced through one status collection endpoint.
    type Status: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Gets the status from the current state.
    fn get_status(state: &Self::State) -> Self::Status;
}

/// Trait for service states which exposes common properties.
pub trait ServiceState: Send + 'static {
    /// Name for a service that can be printed in logs.
    ///
    /// This SHOULD NOT change after the service worker has been started.
    fn name(&self) -> &str;
}

/// Trait for async service impls to define their per-input logic.
pub trait AsyncService: Service + Send + Sync + 'static {
    /// Called once before the input loop starts.
    fn on_launch(
        state: &mut Self::State,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        let _ = state;
        async { Ok(()) }
    }

    /// Processes one input.
    fn process_input(
        state: &mut Self::State,
        input: &Self::Msg,
    ) -> impl std::future::Future<Output = anyhow::Result<Response>> + Send;
}

/// Trait for blocking service impls to define their per-input logic.
pub trait SyncService: Service + Send + Sync + 'static {
    /// Called once before the input loop starts.
    fn on_launch(state: &mut Self::State) -> anyhow::Result<()> {
        let _ = state;
        Ok(())
    }

    /// Processes one input.
    fn process_input(state: &mut Self::State, input: &Self::Msg) -> anyhow::Result<Response>;
}

/// Generic service input trait.
pub trait ServiceInput {
    /// The message type.
    type Msg: Debug;
}

/// Common interface for async service input sources.
pub trait AsyncServiceInput: ServiceInput + Send + 'static {
    /// Receives the "next input". If this returns `Ok(None)` then there is
    /// no more input and the worker should exit.
    fn recv_next(
        &mut self,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<Self::Msg>>> + Send;
}

/// Common interface for blocking service input sources.
pub trait SyncServiceInput: ServiceInput + Send + 'static {
    /// Receives the "next input". If this returns `Ok(None)` then there is
    /// no more input and the worker should exit.
    fn recv_next(&mut self) -> anyhow::Result<Option<Self::Msg>>;
}
