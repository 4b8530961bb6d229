//! Incremental construction of state machines.

use crate::error::CoreError;
use crate::machine::StateMachine;
use crate::state::State;
use crate::tracker::DEFAULT_MAX_CYCLES;
use crate::transition::Transition;

/// Accumulates states and transitions for a [`StateMachine`].
///
/// Nothing is checked until [`MachineBuilder::build`], which hands everything
/// to [`StateMachine::with_max_cycles`].
#[derive(Debug, Clone)]
pub struct MachineBuilder {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
    max_cycles: usize,
}

impl MachineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            max_cycles: DEFAULT_MAX_CYCLES,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    #[must_use]
    pub fn with_states(mut self, states: impl IntoIterator<Item = State>) -> Self {
        self.states.extend(states);
        self
    }

    #[must_use]
    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    #[must_use]
    pub fn with_transitions(mut self, transitions: impl IntoIterator<Item = Transition>) -> Self {
        self.transitions.extend(transitions);
        self
    }

    /// Sets how often a single state may be visited during one run.
    #[must_use]
    pub fn with_max_cycles(mut self, max_cycles: usize) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn add_state(&mut self, state: State) -> &mut Self {
        self.states.push(state);
        self
    }

    pub fn add_transition(&mut self, transition: Transition) -> &mut Self {
        self.transitions.push(transition);
        self
    }

    pub fn build(self) -> Result<StateMachine, CoreError> {
        StateMachine::with_max_cycles(self.name, self.states, self.transitions, self.max_cycles)
    }
}
