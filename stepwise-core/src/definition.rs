//! State machine definition types.
//!
//! Machines can be described in JSON or YAML:
//!
//! ```yaml
//! name: video_transcoding
//! states:
//!   - name: new
//!     kind: initial
//!     transitions:
//!       - to: transcoding
//!         when: input.needs_transcode
//!       - to: rejected
//!         when: "!input.needs_transcode"
//!   - name: transcoding
//!     settings:
//!       output:
//!         transcoded: "true"
//!     transitions:
//!       - to: ready
//!   - name: ready
//!     kind: final
//!   - name: rejected
//!     kind: final
//! ```
//!
//! Loading only checks the document itself. Graph structure is validated when
//! the definition is turned into a [`StateMachine`].

use crate::builder::MachineBuilder;
use crate::constraint::ExpressionConstraint;
use crate::error::CoreError;
use crate::expr::{ExprEngine, ExpressionEngine};
use crate::machine::StateMachine;
use crate::params::Params;
use crate::state::{State, StateKind, OUTPUT_SETTING};
use crate::transition::Transition;
use crate::validator::{JsonSchema, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// A state as written in a definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,

    #[serde(default)]
    pub kind: StateKind,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub breakpoint: bool,

    /// Free-form settings; `output` holds export expressions.
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub settings: Params,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Outgoing transitions, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDefinition>,
}

/// An outgoing transition as written in a definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Target state.
    pub to: String,

    /// Guard expressions. Can be a single expression or several, all of
    /// which must hold.
    #[serde(
        default,
        deserialize_with = "deserialize_guards",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub when: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub settings: Params,
}

fn deserialize_guards<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct GuardsVisitor;

    impl<'de> Visitor<'de> for GuardsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut guards = Vec::new();
            while let Some(g) = seq.next_element::<String>()? {
                guards.push(g);
            }
            Ok(guards)
        }
    }

    deserializer.deserialize_any(GuardsVisitor)
}

/// Raw machine definition as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    /// Machine name.
    pub name: String,

    /// Per-state visit ceiling for a single run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cycles: Option<usize>,

    /// All states, in declaration order.
    pub states: Vec<StateDefinition>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A parsed machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    raw: MachineDefinitionRaw,

    /// Hash of the canonical JSON form, for integrity checks.
    checksum: String,
}

impl MachineDefinition {
    /// Parses a definition from a JSON value.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses a definition from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Parses a definition from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Loads a definition from disk. The format follows the file extension:
    /// `.json`, `.yaml` or `.yml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Err(CoreError::InvalidDefinition {
                reason: format!(
                    "unsupported definition format: {} (expected .json, .yaml or .yml)",
                    path.display()
                ),
            }),
        }
    }

    /// Checks a raw definition and computes its checksum.
    pub fn from_raw(raw: MachineDefinitionRaw) -> Result<Self, CoreError> {
        if raw.name.trim().is_empty() {
            return Err(invalid("machine name must not be empty"));
        }
        if raw.states.is_empty() {
            return Err(invalid("at least one state is required"));
        }
        if raw.max_cycles == Some(0) {
            return Err(invalid("max_cycles must be at least 1"));
        }

        for state in &raw.states {
            if state.name.is_empty() {
                return Err(invalid("state name must not be empty"));
            }
            if let Some(output) = state.settings.get(OUTPUT_SETTING) {
                if !output.is_object() {
                    return Err(invalid(format!(
                        "state '{}': '{}' setting must be an object",
                        state.name, OUTPUT_SETTING
                    )));
                }
            }
        }

        // Compute checksum
        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self { raw, checksum })
    }

    pub fn name(&self) -> &str {
        &self.raw.name
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn raw(&self) -> &MachineDefinitionRaw {
        &self.raw
    }

    pub fn states(&self) -> &[StateDefinition] {
        &self.raw.states
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }

    /// Builds the machine using the default expression engine.
    pub fn build(&self) -> Result<StateMachine, CoreError> {
        self.builder()?.build()
    }

    /// Returns a builder preloaded with this definition.
    pub fn builder(&self) -> Result<MachineBuilder, CoreError> {
        self.builder_with_engine(Arc::new(ExprEngine::new()))
    }

    /// Like [`MachineDefinition::builder`], evaluating guards and exports
    /// with `engine`.
    pub fn builder_with_engine(
        &self,
        engine: Arc<dyn ExpressionEngine>,
    ) -> Result<MachineBuilder, CoreError> {
        let mut builder = MachineBuilder::new(&self.raw.name);
        if let Some(max_cycles) = self.raw.max_cycles {
            builder = builder.with_max_cycles(max_cycles);
        }

        for def in &self.raw.states {
            builder.add_state(self.build_state(def, &engine)?);

            for t in &def.transitions {
                let mut transition =
                    Transition::new(&def.name, &t.to).with_settings(t.settings.clone());
                if let Some(label) = &t.label {
                    transition = transition.with_label(label);
                }
                for guard in &t.when {
                    let constraint = ExpressionConstraint::new(guard, Arc::clone(&engine));
                    constraint.check()?;
                    transition = transition.with_constraint(constraint);
                }
                builder.add_transition(transition);
            }
        }

        Ok(builder)
    }

    fn build_state(
        &self,
        def: &StateDefinition,
        engine: &Arc<dyn ExpressionEngine>,
    ) -> Result<State, CoreError> {
        // Exports must at least parse
        if let Some(Value::Object(exports)) = def.settings.get(OUTPUT_SETTING) {
            for expression in exports.values().filter_map(Value::as_str) {
                engine
                    .check(expression)
                    .map_err(|e| CoreError::Expression {
                        expression: expression.to_string(),
                        reason: e.to_string(),
                        bindings: vec!["input".to_string()],
                    })?;
            }
        }

        let mut validator = Validator::accept_all();
        if let Some(schema) = &def.input_schema {
            validator = validator.with_input_schema(Arc::new(JsonSchema::compile(schema.clone())?));
        }
        if let Some(schema) = &def.output_schema {
            validator =
                validator.with_output_schema(Arc::new(JsonSchema::compile(schema.clone())?));
        }

        Ok(State::new(&def.name, def.kind)
            .with_breakpoint(def.breakpoint)
            .with_settings(def.settings.clone())
            .with_validator(validator)
            .with_expression_engine(Arc::clone(engine)))
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}
