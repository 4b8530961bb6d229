//! # stepwise-core
//!
//! Deterministic state machine execution engine.
//!
//! This crate provides:
//! - Immutable parameter records passed between states
//! - States with export expressions and schema validation
//! - Guarded transitions and structural validation of machines
//! - A sequential executor with breakpoints and runaway-loop detection
//! - JSON/YAML machine definitions

pub mod builder;
pub mod collection;
pub mod constraint;
pub mod definition;
pub mod error;
pub mod expr;
pub mod listener;
pub mod machine;
pub mod params;
pub mod state;
pub mod tracker;
pub mod transition;
pub mod validator;

pub use builder::MachineBuilder;
pub use collection::{StateMap, TransitionIndex};
pub use constraint::{Constraint, ExpressionConstraint, PredicateConstraint};
pub use definition::{MachineDefinition, MachineDefinitionRaw, StateDefinition, TransitionDefinition};
pub use error::{CoreError, FlowViolation};
pub use expr::{ExprEngine, ExpressionEngine, ExpressionError};
pub use listener::{ExecutionListener, NoopListener, TracingListener};
pub use machine::StateMachine;
pub use params::Params;
pub use state::{Input, Output, State, StateKind};
pub use tracker::{ExecutionTracker, DEFAULT_MAX_CYCLES};
pub use transition::Transition;
pub use validator::{AcceptAll, JsonSchema, Schema, Validator, Violation};
