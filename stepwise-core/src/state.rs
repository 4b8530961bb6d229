//! States and the records flowing between them.

use crate::error::CoreError;
use crate::expr::{Bindings, ExprEngine, ExpressionEngine};
use crate::params::Params;
use crate::validator::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Settings key holding the export expressions of a state.
pub const OUTPUT_SETTING: &str = "output";

/// Data handed to a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Input {
    params: Params,
}

impl Input {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    /// Carries the parameters of a previous step forward.
    pub fn from_output(output: &Output) -> Self {
        Self {
            params: output.params.clone(),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.params.get(path)
    }

    #[must_use]
    pub fn with_param(&self, path: &str, value: Value) -> Self {
        Self::new(self.params.with_param(path, value))
    }

    #[must_use]
    pub fn without_param(&self, path: &str) -> Self {
        Self::new(self.params.without_param(path))
    }
}

impl From<Params> for Input {
    fn from(params: Params) -> Self {
        Self::new(params)
    }
}

/// Data produced by a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    current_state: String,
    params: Params,
}

impl Output {
    pub fn new(current_state: impl Into<String>, params: Params) -> Self {
        Self {
            current_state: current_state.into(),
            params,
        }
    }

    /// Starts an output for `state` that passes every input parameter through.
    pub fn from_input(state: impl Into<String>, input: &Input) -> Self {
        Self::new(state, input.params.clone())
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.params.get(path)
    }

    #[must_use]
    pub fn with_current_state(&self, state: impl Into<String>) -> Self {
        Self::new(state, self.params.clone())
    }

    #[must_use]
    pub fn with_param(&self, path: &str, value: Value) -> Self {
        Self::new(self.current_state.clone(), self.params.with_param(path, value))
    }

    #[must_use]
    pub fn with_params<I, K>(&self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        Self::new(self.current_state.clone(), self.params.with_params(params))
    }

    #[must_use]
    pub fn without_param(&self, path: &str) -> Self {
        Self::new(self.current_state.clone(), self.params.without_param(path))
    }

    /// Splits the output into its parts.
    pub fn into_parts(self) -> (String, Params) {
        (self.current_state, self.params)
    }
}

/// The role a state plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Entry point; exactly one per machine.
    Initial,
    /// Regular step.
    #[default]
    Active,
    /// Step that waits for outside interaction; always a breakpoint.
    Interactive,
    /// Terminal state; no outgoing transitions.
    Final,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateKind::Initial => "initial",
            StateKind::Active => "active",
            StateKind::Interactive => "interactive",
            StateKind::Final => "final",
        })
    }
}

/// A node in a state machine.
#[derive(Debug, Clone)]
pub struct State {
    name: String,
    kind: StateKind,
    breakpoint: bool,
    settings: Params,
    validator: Validator,
    engine: Arc<dyn ExpressionEngine>,
}

impl State {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            breakpoint: false,
            settings: Params::new(),
            validator: Validator::accept_all(),
            engine: Arc::new(ExprEngine::new()),
        }
    }

    pub fn initial(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Initial)
    }

    pub fn active(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Active)
    }

    pub fn interactive(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Interactive)
    }

    pub fn terminal(name: impl Into<String>) -> Self {
        Self::new(name, StateKind::Final)
    }

    #[must_use]
    pub fn with_breakpoint(mut self, breakpoint: bool) -> Self {
        self.breakpoint = breakpoint;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Params) -> Self {
        self.settings = settings;
        self
    }

    /// Adds an export: after execution, `path` holds the value of `expression`.
    #[must_use]
    pub fn with_export(mut self, path: &str, expression: impl Into<String>) -> Self {
        let mut exports = self
            .settings
            .get(OUTPUT_SETTING)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        exports.insert(path.to_string(), Value::String(expression.into()));
        self.settings = self
            .settings
            .with_param(OUTPUT_SETTING, Value::Object(exports));
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_expression_engine(mut self, engine: Arc<dyn ExpressionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn is_initial(&self) -> bool {
        self.kind == StateKind::Initial
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }

    pub fn is_interactive(&self) -> bool {
        self.kind == StateKind::Interactive
    }

    /// Returns true if execution may pause here.
    pub fn is_breakpoint(&self) -> bool {
        self.breakpoint || self.is_interactive()
    }

    pub fn settings(&self) -> &Params {
        &self.settings
    }

    pub fn setting(&self, path: &str) -> Option<&Value> {
        self.settings.get(path)
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Runs this state: validates `input`, evaluates the exports and
    /// validates the produced output.
    pub fn execute(&self, input: &Input) -> Result<Output, CoreError> {
        self.validator.validate_input(&self.name, input)?;

        let exports = self.evaluate_exports(input)?;
        let output = Output::from_input(&self.name, input).with_params(exports);

        self.validator.validate_output(&self.name, &output)?;
        Ok(output)
    }

    fn evaluate_exports(&self, input: &Input) -> Result<Vec<(String, Value)>, CoreError> {
        let Some(exports) = self.settings.get(OUTPUT_SETTING).and_then(Value::as_object) else {
            return Ok(Vec::new());
        };

        let mut bindings = Bindings::new();
        bindings.insert("input".to_string(), input.params().to_value());

        let mut values = Vec::with_capacity(exports.len());
        for (key, export) in exports {
            let value = match export {
                Value::String(expression) => self
                    .engine
                    .evaluate(expression, &bindings)
                    .map_err(|e| CoreError::Expression {
                        expression: expression.clone(),
                        reason: e.to_string(),
                        bindings: bindings.keys().cloned().collect(),
                    })?,
                literal => literal.clone(),
            };
            values.push((key.clone(), value));
        }
        Ok(values)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)?;
        if self.breakpoint {
            f.write_str(" [breakpoint]")?;
        }
        Ok(())
    }
}
