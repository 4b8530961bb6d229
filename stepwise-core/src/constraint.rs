//! Guard constraints gating transitions.

use crate::error::CoreError;
use crate::expr::{Bindings, ExprEngine, ExpressionEngine};
use crate::state::{Input, Output};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A predicate over the input and output of a step.
pub trait Constraint: Send + Sync + fmt::Debug + fmt::Display {
    /// Returns true if the transition guarded by this constraint may fire.
    fn accepts(&self, input: &Input, output: &Output) -> Result<bool, CoreError>;
}

/// Constraint backed by an expression evaluated by an injected engine.
///
/// The expression sees two bindings: `input` (parameters handed to the state)
/// and `output` (parameters it produced, plus `current_state`). The state name
/// always wins over a parameter called `current_state`.
#[derive(Debug, Clone)]
pub struct ExpressionConstraint {
    expression: String,
    engine: Arc<dyn ExpressionEngine>,
}

impl ExpressionConstraint {
    pub fn new(expression: impl Into<String>, engine: Arc<dyn ExpressionEngine>) -> Self {
        Self {
            expression: expression.into(),
            engine,
        }
    }

    /// Uses the default [`ExprEngine`].
    pub fn parse(expression: impl Into<String>) -> Result<Self, CoreError> {
        let constraint = Self::new(expression, Arc::new(ExprEngine::new()));
        constraint.check()?;
        Ok(constraint)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Checks that the expression is well-formed for the engine.
    pub fn check(&self) -> Result<(), CoreError> {
        self.engine
            .check(&self.expression)
            .map_err(|e| CoreError::Expression {
                expression: self.expression.clone(),
                reason: e.to_string(),
                bindings: vec!["input".to_string(), "output".to_string()],
            })
    }
}

pub(crate) fn guard_bindings(input: &Input, output: &Output) -> Bindings {
    let mut out = output.params().to_value();
    if let Value::Object(map) = &mut out {
        map.insert(
            "current_state".to_string(),
            Value::String(output.current_state().to_string()),
        );
    }

    let mut bindings = Bindings::new();
    bindings.insert("input".to_string(), input.params().to_value());
    bindings.insert("output".to_string(), out);
    bindings
}

impl Constraint for ExpressionConstraint {
    fn accepts(&self, input: &Input, output: &Output) -> Result<bool, CoreError> {
        let bindings = guard_bindings(input, output);
        self.engine
            .evaluate_bool(&self.expression, &bindings)
            .map_err(|e| CoreError::Expression {
                expression: self.expression.clone(),
                reason: e.to_string(),
                bindings: bindings.keys().cloned().collect(),
            })
    }
}

impl fmt::Display for ExpressionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

type Predicate = dyn Fn(&Input, &Output) -> bool + Send + Sync;

/// Constraint backed by a Rust closure.
#[derive(Clone)]
pub struct PredicateConstraint {
    label: String,
    predicate: Arc<Predicate>,
}

impl PredicateConstraint {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Input, &Output) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateConstraint")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PredicateConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl Constraint for PredicateConstraint {
    fn accepts(&self, input: &Input, output: &Output) -> Result<bool, CoreError> {
        Ok((self.predicate)(input, output))
    }
}
