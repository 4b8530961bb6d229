//! Input/output validation gates.
//!
//! A [`Validator`] pairs an input schema with an output schema. The schema
//! engine itself is injected through the [`Schema`] trait; [`JsonSchema`]
//! adapts the `jsonschema` crate.

use crate::error::CoreError;
use crate::state::{Input, Output};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A single schema violation, keyed by the offending property path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// JSON pointer to the offending value (empty for the root).
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// An injected schema engine.
pub trait Schema: Send + Sync + fmt::Debug {
    /// Returns every violation of `value` against this schema.
    fn violations(&self, value: &Value) -> Vec<Violation>;
}

/// Schema that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Schema for AcceptAll {
    fn violations(&self, _value: &Value) -> Vec<Violation> {
        Vec::new()
    }
}

/// A compiled JSON Schema.
pub struct JsonSchema {
    source: Value,
    validator: jsonschema::Validator,
}

impl JsonSchema {
    /// Compiles `schema`, failing with [`CoreError::InvalidSchema`] if it is malformed.
    pub fn compile(schema: Value) -> Result<Self, CoreError> {
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| CoreError::InvalidSchema {
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: schema,
            validator,
        })
    }

    pub fn source(&self) -> &Value {
        &self.source
    }
}

impl fmt::Debug for JsonSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchema")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Schema for JsonSchema {
    fn violations(&self, value: &Value) -> Vec<Violation> {
        self.validator
            .iter_errors(value)
            .map(|e| Violation::new(e.instance_path.to_string(), e.to_string()))
            .collect()
    }
}

/// Validates a state's input before and its output after execution.
#[derive(Debug, Clone)]
pub struct Validator {
    input: Arc<dyn Schema>,
    output: Arc<dyn Schema>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl Validator {
    pub fn new(input: Arc<dyn Schema>, output: Arc<dyn Schema>) -> Self {
        Self { input, output }
    }

    pub fn accept_all() -> Self {
        Self::new(Arc::new(AcceptAll), Arc::new(AcceptAll))
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.input = schema;
        self
    }

    #[must_use]
    pub fn with_output_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.output = schema;
        self
    }

    /// Checks the parameters of `input` against the input schema.
    pub fn validate_input(&self, state: &str, input: &Input) -> Result<(), CoreError> {
        let violations = self.input.violations(&input.params().to_value());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidInput {
                state: state.to_string(),
                violations,
            })
        }
    }

    /// Checks the parameters of `output` against the output schema.
    pub fn validate_output(&self, state: &str, output: &Output) -> Result<(), CoreError> {
        let violations = self.output.violations(&output.params().to_value());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidOutput {
                state: state.to_string(),
                violations,
            })
        }
    }
}
