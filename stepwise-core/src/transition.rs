//! Guarded transitions between states.

use crate::constraint::{Constraint, ExpressionConstraint};
use crate::error::CoreError;
use crate::params::Params;
use crate::state::{Input, Output};
use std::fmt;
use std::sync::Arc;

/// A directed edge between two states.
///
/// A transition is activated when every one of its constraints accepts the
/// current input/output pair. Without constraints it is always activated.
#[derive(Debug, Clone)]
pub struct Transition {
    from: String,
    to: String,
    label: Option<String>,
    settings: Params,
    constraints: Vec<Arc<dyn Constraint>>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
            settings: Params::new(),
            constraints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Constraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    #[must_use]
    pub fn with_shared_constraint(mut self, constraint: Arc<dyn Constraint>) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Adds a guard expression evaluated by the default engine.
    pub fn when(self, expression: impl Into<String>) -> Result<Self, CoreError> {
        Ok(self.with_constraint(ExpressionConstraint::parse(expression)?))
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Params) -> Self {
        self.settings = settings;
        self
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn settings(&self) -> &Params {
        &self.settings
    }

    pub fn constraints(&self) -> &[Arc<dyn Constraint>] {
        &self.constraints
    }

    pub fn has_constraints(&self) -> bool {
        !self.constraints.is_empty()
    }

    /// Returns true if all constraints accept `(input, output)`.
    pub fn is_activated_by(&self, input: &Input, output: &Output) -> Result<bool, CoreError> {
        for constraint in &self.constraints {
            if !constraint.accepts(input, output)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)?;
        if !self.constraints.is_empty() {
            let guards: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
            write!(f, " [{}]", guards.join(" and "))?;
        }
        Ok(())
    }
}
