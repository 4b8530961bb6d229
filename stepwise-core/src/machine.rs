//! The state machine: a validated graph and its execution loop.

use crate::builder::MachineBuilder;
use crate::collection::{Edge, StateMap, TransitionIndex};
use crate::error::{CoreError, FlowViolation};
use crate::listener::{ExecutionListener, NoopListener};
use crate::state::{Input, Output, State};
use crate::tracker::{ExecutionTracker, DEFAULT_MAX_CYCLES};
use crate::transition::Transition;

/// An immutable, validated state machine.
///
/// Construction checks every structural invariant once; execution assumes
/// they hold. A machine can be shared between threads and executed
/// concurrently, each run owning its own tracker and records.
#[derive(Debug, Clone)]
pub struct StateMachine {
    name: String,
    states: StateMap,
    transitions: TransitionIndex,
    initial: usize,
    finals: Vec<usize>,
    max_cycles: usize,
}

impl StateMachine {
    /// Builds a machine, failing with [`CoreError::InvalidStructure`] if the
    /// graph is ill-formed.
    pub fn new(
        name: impl Into<String>,
        states: Vec<State>,
        transitions: Vec<Transition>,
    ) -> Result<Self, CoreError> {
        Self::with_max_cycles(name, states, transitions, DEFAULT_MAX_CYCLES)
    }

    /// Like [`StateMachine::new`] with a custom per-state visit ceiling.
    pub fn with_max_cycles(
        name: impl Into<String>,
        states: Vec<State>,
        transitions: Vec<Transition>,
        max_cycles: usize,
    ) -> Result<Self, CoreError> {
        let name = name.into();

        let mut map = StateMap::new();
        for state in states {
            map.insert(state)?;
        }

        // Initial and final states
        let initials: Vec<usize> = (0..map.len())
            .filter(|&id| map.by_id(id).is_initial())
            .collect();
        let initial = match initials.as_slice() {
            [id] => *id,
            [] => return Err(CoreError::structure("no initial state defined")),
            many => {
                let names: Vec<&str> = many.iter().map(|&id| map.by_id(id).name()).collect();
                return Err(CoreError::structure(format!(
                    "more than one initial state: {}",
                    names.join(", ")
                )));
            }
        };

        let finals: Vec<usize> = (0..map.len())
            .filter(|&id| map.by_id(id).is_final())
            .collect();
        if finals.is_empty() {
            return Err(CoreError::structure("no final state defined"));
        }

        // Transition endpoints
        let index = TransitionIndex::resolve(&map, transitions)?;
        for (id, state) in map.iter().enumerate() {
            let outgoing = index.from_state(id);
            if state.is_final() && !outgoing.is_empty() {
                return Err(CoreError::structure(format!(
                    "final state '{}' may not have outgoing transitions",
                    state.name()
                )));
            }
            if !state.is_final() && outgoing.is_empty() {
                return Err(CoreError::structure(format!(
                    "non-final state '{}' has no outgoing transitions",
                    state.name()
                )));
            }
            if let Some(edge) = outgoing.iter().find(|e| e.target == initial) {
                return Err(CoreError::structure(format!(
                    "transition '{}' leads back into initial state '{}'",
                    edge.transition,
                    map.by_id(initial).name()
                )));
            }
        }

        // Reachability
        let visited = index.reachable_from(initial);
        let unreachable: Vec<&str> = visited
            .iter()
            .enumerate()
            .filter(|(_, &seen)| !seen)
            .map(|(id, _)| map.by_id(id).name())
            .collect();
        if !unreachable.is_empty() {
            return Err(CoreError::structure(format!(
                "not all states are properly connected; unreachable: {}",
                unreachable.join(", ")
            )));
        }

        tracing::debug!(
            "Built machine '{}': {} states, {} transitions, initial '{}'",
            name,
            map.len(),
            index.len(),
            map.by_id(initial).name()
        );

        Ok(Self {
            name,
            states: map,
            transitions: index,
            initial,
            finals,
            max_cycles: max_cycles.max(1),
        })
    }

    /// Starts a builder for a machine called `name`.
    pub fn builder(name: impl Into<String>) -> MachineBuilder {
        MachineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &StateMap {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    pub fn initial_state(&self) -> &State {
        self.states.by_id(self.initial)
    }

    pub fn final_states(&self) -> impl Iterator<Item = &State> {
        self.finals.iter().map(|&id| self.states.by_id(id))
    }

    /// Outgoing transitions of `state`, in declaration order.
    pub fn transitions_from(&self, state: &str) -> Vec<&Transition> {
        self.states
            .id_of(state)
            .map(|id| {
                self.transitions
                    .from_state(id)
                    .iter()
                    .map(|e| &e.transition)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All transitions, grouped by source state.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().map(|e| &e.transition)
    }

    pub fn max_cycles(&self) -> usize {
        self.max_cycles
    }

    /// Runs the machine from `start` until it halts at a final state or a
    /// breakpoint.
    pub fn execute(&self, input: Input, start: &str) -> Result<Output, CoreError> {
        self.execute_with(input, start, &NoopListener)
    }

    /// Runs the machine from its initial state.
    pub fn execute_from_initial(&self, input: Input) -> Result<Output, CoreError> {
        self.execute(input, self.initial_state().name())
    }

    /// Continues a run that paused at a breakpoint.
    pub fn resume(&self, output: &Output) -> Result<Output, CoreError> {
        self.execute(Input::from_output(output), output.current_state())
    }

    /// Like [`StateMachine::execute`], notifying `listener` along the way.
    pub fn execute_with(
        &self,
        input: Input,
        start: &str,
        listener: &dyn ExecutionListener,
    ) -> Result<Output, CoreError> {
        let mut current = self
            .states
            .id_of(start)
            .ok_or_else(|| CoreError::UnknownState {
                state: start.to_string(),
            })?;
        let first = self.states.by_id(current);
        if first.is_final() {
            return Err(FlowViolation::FinalStateExecution {
                state: start.to_string(),
            }
            .into());
        }

        listener.on_started(&self.name, first, &input);
        let mut tracker = ExecutionTracker::new(&self.states);
        let mut input = input;

        loop {
            let state = self.states.by_id(current);
            listener.on_state_entered(state, &input);
            let output = state.execute(&input)?;
            listener.on_state_exited(state, &output);

            let next = self.activated_edge(current, &input, &output)?;

            if tracker.track_id(current) > self.max_cycles {
                let cycle = tracker.detect_execution_loop();
                tracing::warn!(
                    "Machine '{}' exceeded {} visits of '{}'; cycle: {}",
                    self.name,
                    self.max_cycles,
                    state.name(),
                    cycle.join(" -> ")
                );
                return Err(FlowViolation::LoopDetected {
                    cycle,
                    steps: tracker.steps(),
                }
                .into());
            }

            let Some(edge) = next else {
                if state.is_final() || state.is_breakpoint() {
                    tracing::debug!("Halting at '{}'", state.name());
                    listener.on_halted(state, &output);
                    return Ok(output);
                }
                return Err(FlowViolation::UnexpectedHalt {
                    state: state.name().to_string(),
                }
                .into());
            };

            let target = self.states.by_id(edge.target);
            tracing::debug!("Transition {}", edge.transition);
            if target.is_breakpoint() {
                let output = output.with_current_state(target.name());
                listener.on_halted(target, &output);
                return Ok(output);
            }

            input = Input::from_output(&output);
            current = edge.target;
        }
    }

    /// Returns the single activated outgoing edge of `state`, if any.
    fn activated_edge(
        &self,
        state: usize,
        input: &Input,
        output: &Output,
    ) -> Result<Option<&Edge>, CoreError> {
        let mut activated: Option<&Edge> = None;

        for edge in self.transitions.from_state(state) {
            let accepted = edge.transition.is_activated_by(input, output)?;
            tracing::trace!("Guard {} -> {}", edge.transition, accepted);
            if !accepted {
                continue;
            }
            if let Some(first) = activated {
                return Err(FlowViolation::AmbiguousTransition {
                    state: self.states.by_id(state).name().to_string(),
                    first: first.transition.to().to_string(),
                    second: edge.transition.to().to_string(),
                }
                .into());
            }
            activated = Some(edge);
        }

        Ok(activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use crate::state::StateKind;
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::sync::Arc;

    fn input(value: Value) -> Input {
        Input::new(Params::from_value(value).unwrap())
    }

    fn guarded(from: &str, to: &str, guard: &str) -> Transition {
        Transition::new(from, to).when(guard).unwrap()
    }

    fn transcoding_machine() -> StateMachine {
        StateMachine::new(
            "video_transcoding",
            vec![
                State::initial("new"),
                State::active("transcoding"),
                State::terminal("ready"),
                State::terminal("rejected"),
            ],
            vec![
                guarded("new", "transcoding", "input.needs_transcode"),
                guarded("new", "rejected", "!input.needs_transcode"),
                Transition::new("transcoding", "ready"),
            ],
        )
        .unwrap()
    }

    fn assert_structure_error(result: Result<StateMachine, CoreError>, needle: &str) {
        match result {
            Err(CoreError::InvalidStructure { reason }) => {
                assert!(reason.contains(needle), "'{}' not in '{}'", needle, reason)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected structure error containing '{}'", needle),
        }
    }

    #[test]
    fn test_linear_scenario() {
        let machine = transcoding_machine();
        let output = machine
            .execute(input(json!({"needs_transcode": true})), "new")
            .unwrap();

        assert_eq!(output.current_state(), "ready");
        assert_eq!(output.get("needs_transcode"), Some(&json!(true)));

        let output = machine
            .execute_from_initial(input(json!({"needs_transcode": false})))
            .unwrap();
        assert_eq!(output.current_state(), "rejected");
    }

    #[test]
    fn test_accessors() {
        let machine = transcoding_machine();
        assert_eq!(machine.name(), "video_transcoding");
        assert_eq!(machine.initial_state().name(), "new");
        let finals: Vec<&str> = machine.final_states().map(|s| s.name()).collect();
        assert_eq!(finals, vec!["ready", "rejected"]);
        assert_eq!(machine.transitions_from("new").len(), 2);
        assert!(machine.transitions_from("ready").is_empty());
        assert!(machine.transitions_from("nope").is_empty());
        assert_eq!(machine.transitions().count(), 3);
        assert_eq!(machine.states().len(), 4);
        assert_eq!(machine.state("transcoding").unwrap().kind(), StateKind::Active);
        assert_eq!(machine.max_cycles(), DEFAULT_MAX_CYCLES);
    }

    #[test]
    fn test_breakpoint_pause_and_resume() {
        let machine = StateMachine::new(
            "pausing",
            vec![
                State::initial("start"),
                State::active("pause").with_breakpoint(true),
                State::terminal("end"),
            ],
            vec![Transition::new("start", "pause"), Transition::new("pause", "end")],
        )
        .unwrap();

        let paused = machine.execute(input(json!({"id": 7})), "start").unwrap();
        assert_eq!(paused.current_state(), "pause");
        assert_eq!(paused.get("id"), Some(&json!(7)));

        let done = machine
            .execute(Input::from_output(&paused), paused.current_state())
            .unwrap();
        assert_eq!(done.current_state(), "end");
        assert_eq!(done.get("id"), Some(&json!(7)));

        assert_eq!(machine.resume(&paused).unwrap(), done);
    }

    #[test]
    fn test_interactive_state_waits_for_input() {
        let machine = StateMachine::new(
            "approval",
            vec![
                State::initial("submitted"),
                State::interactive("review"),
                State::terminal("approved"),
            ],
            vec![
                Transition::new("submitted", "review"),
                guarded("review", "approved", "input.approved"),
            ],
        )
        .unwrap();

        let waiting = machine.execute(Input::default(), "submitted").unwrap();
        assert_eq!(waiting.current_state(), "review");

        // Nothing activated: the interactive state is a legal halt
        let still_waiting = machine.resume(&waiting).unwrap();
        assert_eq!(still_waiting.current_state(), "review");

        let approved = machine
            .resume(&still_waiting.with_param("approved", json!(true)))
            .unwrap();
        assert_eq!(approved.current_state(), "approved");
    }

    #[test]
    fn test_ambiguous_transition() {
        let machine = StateMachine::new(
            "ambiguous",
            vec![
                State::initial("x"),
                State::terminal("left"),
                State::terminal("right"),
            ],
            vec![
                guarded("x", "left", "input.go"),
                guarded("x", "right", "input.go == true"),
            ],
        )
        .unwrap();

        let err = machine.execute(input(json!({"go": true})), "x").unwrap_err();
        match err {
            CoreError::CorruptExecutionFlow(FlowViolation::AmbiguousTransition {
                state,
                first,
                second,
            }) => {
                assert_eq!(state, "x");
                assert_eq!(first, "left");
                assert_eq!(second, "right");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The machine stays usable
        let err = machine.execute(input(json!({"go": false})), "x").unwrap_err();
        assert!(matches!(
            err,
            CoreError::CorruptExecutionFlow(FlowViolation::UnexpectedHalt { .. })
        ));
    }

    #[test]
    fn test_unexpected_halt() {
        let machine = StateMachine::new(
            "stuck",
            vec![
                State::initial("a"),
                State::active("b"),
                State::terminal("c"),
            ],
            vec![Transition::new("a", "b"), guarded("b", "c", "input.done")],
        )
        .unwrap();

        let err = machine.execute(Input::default(), "a").unwrap_err();
        assert_eq!(
            err.to_string(),
            "corrupt execution flow: unexpected halt at 'b': only final states and breakpoints may pause execution"
        );
    }

    #[test]
    fn test_cannot_execute_at_final_state() {
        let machine = transcoding_machine();
        let err = machine.execute(Input::default(), "ready").unwrap_err();
        assert!(matches!(
            err,
            CoreError::CorruptExecutionFlow(FlowViolation::FinalStateExecution { .. })
        ));

        let err = machine.execute(Input::default(), "missing").unwrap_err();
        assert!(matches!(err, CoreError::UnknownState { .. }));
    }

    #[test]
    fn test_runaway_cycle_is_reported() {
        let machine = StateMachine::new(
            "spinning",
            vec![
                State::initial("init"),
                State::active("a"),
                State::active("b"),
                State::active("c"),
                State::terminal("end"),
            ],
            vec![
                Transition::new("init", "a"),
                Transition::new("a", "b"),
                Transition::new("b", "c"),
                guarded("c", "a", "!input.stop"),
                guarded("c", "end", "input.stop"),
            ],
        )
        .unwrap();

        let err = machine.execute(Input::default(), "init").unwrap_err();
        match err {
            CoreError::CorruptExecutionFlow(FlowViolation::LoopDetected { cycle, steps }) => {
                assert_eq!(cycle, vec!["a", "b", "c"]);
                assert_eq!(steps, 1 + 3 * DEFAULT_MAX_CYCLES + 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_counting_loop_terminates_under_budget() {
        let machine = StateMachine::with_max_cycles(
            "counter",
            vec![
                State::initial("init").with_export("n", "0"),
                State::active("inc").with_export("n", "input.n + 1"),
                State::terminal("done"),
            ],
            vec![
                Transition::new("init", "inc"),
                guarded("inc", "inc", "output.n < 5"),
                guarded("inc", "done", "output.n >= 5"),
            ],
            5,
        )
        .unwrap();

        let output = machine.execute(Input::default(), "init").unwrap();
        assert_eq!(output.get("n"), Some(&json!(5)));

        let tight = StateMachine::with_max_cycles(
            "counter",
            vec![
                State::initial("init").with_export("n", "0"),
                State::active("inc").with_export("n", "input.n + 1"),
                State::terminal("done"),
            ],
            vec![
                Transition::new("init", "inc"),
                guarded("inc", "inc", "output.n < 5"),
                guarded("inc", "done", "output.n >= 5"),
            ],
            4,
        )
        .unwrap();
        let err = tight.execute(Input::default(), "init").unwrap_err();
        match err {
            CoreError::CorruptExecutionFlow(FlowViolation::LoopDetected { cycle, .. }) => {
                assert_eq!(cycle, vec!["inc"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_guard_errors_propagate() {
        let machine = StateMachine::new(
            "broken",
            vec![State::initial("a"), State::terminal("b")],
            vec![guarded("a", "b", "event.kind == \"go\"")],
        )
        .unwrap();

        let err = machine.execute(Input::default(), "a").unwrap_err();
        assert_eq!(err.error_code(), "EXPRESSION_ERROR");
    }

    #[test]
    fn test_initial_state_uniqueness() {
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::active("a"), State::terminal("b")],
                vec![Transition::new("a", "b")],
            ),
            "no initial state",
        );
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::initial("b"), State::terminal("c")],
                vec![Transition::new("a", "c"), Transition::new("b", "c")],
            ),
            "more than one initial state: a, b",
        );
    }

    #[test]
    fn test_final_state_required() {
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::active("b")],
                vec![Transition::new("a", "b"), Transition::new("b", "a")],
            ),
            "no final state",
        );
    }

    #[test]
    fn test_structural_edge_rules() {
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::terminal("b")],
                vec![Transition::new("a", "ghost")],
            ),
            "unknown state 'ghost'",
        );
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::active("b"), State::terminal("c")],
                vec![
                    Transition::new("a", "b"),
                    Transition::new("b", "a"),
                    Transition::new("b", "c"),
                ],
            ),
            "initial state 'a'",
        );
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::terminal("b"), State::active("c")],
                vec![
                    Transition::new("a", "b"),
                    Transition::new("b", "c"),
                    Transition::new("a", "c"),
                    Transition::new("c", "b"),
                ],
            ),
            "final state 'b' may not have outgoing transitions",
        );
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::active("b"), State::terminal("c")],
                vec![Transition::new("a", "b"), Transition::new("a", "c")],
            ),
            "non-final state 'b' has no outgoing transitions",
        );
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![State::initial("a"), State::terminal("a")],
                vec![Transition::new("a", "a")],
            ),
            "duplicate state 'a'",
        );
    }

    #[test]
    fn test_unreachable_state() {
        assert_structure_error(
            StateMachine::new(
                "m",
                vec![
                    State::initial("a"),
                    State::terminal("b"),
                    State::active("island"),
                ],
                vec![Transition::new("a", "b"), Transition::new("island", "b")],
            ),
            "not all states are properly connected; unreachable: island",
        );
    }

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl ExecutionListener for Recorder {
        fn on_started(&self, machine: &str, state: &State, _input: &Input) {
            self.events
                .borrow_mut()
                .push(format!("start {}@{}", machine, state.name()));
        }

        fn on_state_entered(&self, state: &State, _input: &Input) {
            self.events.borrow_mut().push(format!("enter {}", state.name()));
        }

        fn on_state_exited(&self, state: &State, _output: &Output) {
            self.events.borrow_mut().push(format!("exit {}", state.name()));
        }

        fn on_halted(&self, state: &State, _output: &Output) {
            self.events.borrow_mut().push(format!("halt {}", state.name()));
        }
    }

    #[test]
    fn test_listener_sees_every_step() {
        let machine = transcoding_machine();
        let recorder = Recorder::default();
        machine
            .execute_with(input(json!({"needs_transcode": true})), "new", &recorder)
            .unwrap();

        assert_eq!(
            recorder.events.into_inner(),
            vec![
                "start video_transcoding@new",
                "enter new",
                "exit new",
                "enter transcoding",
                "exit transcoding",
                "enter ready",
                "exit ready",
                "halt ready",
            ]
        );
    }

    #[test]
    fn test_concurrent_runs_share_machine() {
        let machine = Arc::new(transcoding_machine());

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let machine = Arc::clone(&machine);
                    scope.spawn(move || {
                        machine
                            .execute(input(json!({"needs_transcode": i % 2 == 0, "i": i})), "new")
                            .unwrap()
                    })
                })
                .collect();

            for (i, handle) in handles.into_iter().enumerate() {
                let output = handle.join().unwrap();
                let expected = if i % 2 == 0 { "ready" } else { "rejected" };
                assert_eq!(output.current_state(), expected);
                assert_eq!(output.get("i"), Some(&json!(i)));
            }
        });
    }
}
