//! Core error types.

use crate::validator::Violation;
use thiserror::Error;

/// Errors from the state machine core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid state machine structure: {reason}")]
    InvalidStructure { reason: String },

    #[error("invalid input for state '{state}': {}", render_violations(.violations))]
    InvalidInput {
        state: String,
        violations: Vec<Violation>,
    },

    #[error("invalid output from state '{state}': {}", render_violations(.violations))]
    InvalidOutput {
        state: String,
        violations: Vec<Violation>,
    },

    #[error("corrupt execution flow: {0}")]
    CorruptExecutionFlow(#[from] FlowViolation),

    #[error("failed to evaluate '{expression}': {reason} (available bindings: {})", .bindings.join(", "))]
    Expression {
        expression: String,
        reason: String,
        bindings: Vec<String>,
    },

    #[error("unknown state: {state}")]
    UnknownState { state: String },

    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Runtime defects in the execution flow of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowViolation {
    #[error("cannot (re)execute at final state '{state}'")]
    FinalStateExecution { state: String },

    #[error("ambiguous transition at '{state}': '{first}' and '{second}' are activated at the same time")]
    AmbiguousTransition {
        state: String,
        first: String,
        second: String,
    },

    #[error("unexpected halt at '{state}': only final states and breakpoints may pause execution")]
    UnexpectedHalt { state: String },

    #[error("execution loop detected after {steps} steps: {}", .cycle.join(" -> "))]
    LoopDetected { cycle: Vec<String>, steps: usize },
}

impl CoreError {
    pub(crate) fn structure(reason: impl Into<String>) -> Self {
        CoreError::InvalidStructure {
            reason: reason.into(),
        }
    }

    /// Returns an error code suitable for CLI and log output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidStructure { .. } => "INVALID_STRUCTURE",
            CoreError::InvalidInput { .. } => "INVALID_INPUT",
            CoreError::InvalidOutput { .. } => "INVALID_OUTPUT",
            CoreError::CorruptExecutionFlow(_) => "CORRUPT_EXECUTION_FLOW",
            CoreError::Expression { .. } => "EXPRESSION_ERROR",
            CoreError::UnknownState { .. } => "UNKNOWN_STATE",
            CoreError::InvalidSchema { .. } => "INVALID_SCHEMA",
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Json(_) => "BAD_REQUEST",
            CoreError::Yaml(_) => "BAD_REQUEST",
        }
    }

    /// Returns true if the error leaves the machine usable for further runs.
    pub fn is_run_local(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidInput { .. }
                | CoreError::InvalidOutput { .. }
                | CoreError::CorruptExecutionFlow(_)
                | CoreError::Expression { .. }
                | CoreError::UnknownState { .. }
        )
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
