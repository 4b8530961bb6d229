//! Execution observers.
//!
//! Listeners are notified at fixed points of a run. They cannot influence the
//! execution; all methods have empty default bodies.

use crate::state::{Input, Output, State};

/// Receives notifications while a machine executes.
pub trait ExecutionListener {
    /// Before the first step.
    fn on_started(&self, _machine: &str, _state: &State, _input: &Input) {}

    /// Before a state executes.
    fn on_state_entered(&self, _state: &State, _input: &Input) {}

    /// After a state produced its output.
    fn on_state_exited(&self, _state: &State, _output: &Output) {}

    /// When the run pauses or finishes at `state`.
    fn on_halted(&self, _state: &State, _output: &Output) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ExecutionListener for NoopListener {}

/// Listener that narrates a run through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl ExecutionListener for TracingListener {
    fn on_started(&self, machine: &str, state: &State, input: &Input) {
        tracing::info!(
            "Executing machine '{}' from '{}' ({} params)",
            machine,
            state.name(),
            input.params().len()
        );
    }

    fn on_state_entered(&self, state: &State, _input: &Input) {
        tracing::info!("Entering state {}", state);
    }

    fn on_state_exited(&self, state: &State, output: &Output) {
        tracing::info!(
            "Leaving state '{}' with {} params",
            state.name(),
            output.params().len()
        );
    }

    fn on_halted(&self, state: &State, output: &Output) {
        if state.is_final() {
            tracing::info!("Finished at final state '{}'", output.current_state());
        } else {
            tracing::info!("Paused at breakpoint '{}'", output.current_state());
        }
    }
}
