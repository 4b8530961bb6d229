//! Command execution.

use crate::config::Config;
use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use std::path::Path;
use stepwise_core::{
    CoreError, ExecutionListener, Input, MachineDefinition, NoopListener, Params, StateKind,
    StateMachine, TracingListener,
};
use thiserror::Error;

/// Errors surfaced by the CLI.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to read '{0}': {1}")]
    Read(String, std::io::Error),

    #[error("invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("input must be a JSON object, got: {0}")]
    InputNotObject(Value),
}

impl CommandError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CommandError::Core(e) => e.error_code(),
            CommandError::Read(..) => "IO_ERROR",
            CommandError::Json(_) | CommandError::InputNotObject(_) => "BAD_REQUEST",
        }
    }
}

/// Executes a command and returns the formatted output.
pub fn execute(cmd: Commands, config: &Config) -> Result<String, CommandError> {
    match cmd {
        Commands::Run {
            definition,
            input,
            start,
            max_cycles,
        } => {
            let machine = load_machine(&definition, config, max_cycles)?;
            let input = match input {
                Some(arg) => parse_input(&arg)?,
                None => Input::default(),
            };
            let start = start.unwrap_or_else(|| machine.initial_state().name().to_string());

            let listener: &dyn ExecutionListener = if config.execution.trace {
                &TracingListener
            } else {
                &NoopListener
            };
            let output = machine.execute_with(input, &start, listener)?;

            let halted = machine.state(output.current_state());
            let status = match halted {
                Some(state) if state.is_final() => "Finished".green(),
                _ => "Paused".yellow(),
            };
            eprintln!(
                "{} {} at {}",
                status,
                machine.name().cyan(),
                output.current_state().yellow()
            );

            Ok(format_json(&serde_json::to_value(&output)?, config.output.pretty))
        }

        Commands::Check { definition } => {
            let def = MachineDefinition::from_file(&definition)?;
            let machine = build(&def, config, None)?;

            let finals: Vec<&str> = machine.final_states().map(|s| s.name()).collect();
            Ok(format!(
                "{} machine {} (checksum: {})\n  States: {} (initial: {}, final: {})\n  Transitions: {}\n  Max cycles: {}",
                "Valid".green(),
                machine.name().cyan(),
                def.checksum(),
                machine.states().len(),
                machine.initial_state().name().yellow(),
                finals.join(", "),
                machine.transitions().count(),
                machine.max_cycles()
            ))
        }

        Commands::Describe { definition } => {
            let machine = load_machine(&definition, config, None)?;
            Ok(describe(&machine))
        }
    }
}

fn load_machine(
    path: &Path,
    config: &Config,
    max_cycles: Option<usize>,
) -> Result<StateMachine, CommandError> {
    let def = MachineDefinition::from_file(path)?;
    tracing::debug!(
        "Loaded definition '{}' from {} (checksum {})",
        def.name(),
        path.display(),
        def.checksum()
    );
    build(&def, config, max_cycles)
}

/// Builds a machine. An explicit `max_cycles` wins over the definition,
/// which wins over the config file.
fn build(
    def: &MachineDefinition,
    config: &Config,
    max_cycles: Option<usize>,
) -> Result<StateMachine, CommandError> {
    let mut builder = def.builder()?;
    match (max_cycles, def.raw().max_cycles) {
        (Some(n), _) => builder = builder.with_max_cycles(n),
        (None, None) => builder = builder.with_max_cycles(config.execution.max_cycles),
        (None, Some(_)) => {}
    }
    Ok(builder.build()?)
}

fn describe(machine: &StateMachine) -> String {
    let mut output = format!("{}\n", format!("Machine {}", machine.name().cyan()).bold());

    for state in machine.states() {
        let kind = match state.kind() {
            StateKind::Initial => state.kind().to_string().green(),
            StateKind::Final => state.kind().to_string().red(),
            StateKind::Interactive => state.kind().to_string().magenta(),
            StateKind::Active => state.kind().to_string().normal(),
        };
        let marker = if state.is_breakpoint() && !state.is_interactive() {
            format!(" {}", "[breakpoint]".yellow())
        } else {
            String::new()
        };
        output.push_str(&format!("  {} ({}){}\n", state.name().bold(), kind, marker));

        if let Some(Value::Object(exports)) = state.setting(stepwise_core::state::OUTPUT_SETTING) {
            for (key, expression) in exports {
                output.push_str(&format!("      {} = {}\n", key, expression));
            }
        }

        for transition in machine.transitions_from(state.name()) {
            let label = transition
                .label()
                .map(|l| format!(" ({})", l.dimmed()))
                .unwrap_or_default();
            output.push_str(&format!("    {}{}\n", transition, label));
        }
    }

    output
}

/// Parses the input argument (either inline JSON or @file.json).
fn parse_input(arg: &str) -> Result<Input, CommandError> {
    let value: Value = if let Some(path) = arg.strip_prefix('@') {
        let content =
            std::fs::read_to_string(path).map_err(|e| CommandError::Read(path.to_string(), e))?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };

    match value {
        Value::Object(map) => Ok(Input::new(Params::from(map))),
        other => Err(CommandError::InputNotObject(other)),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value, pretty: bool) -> String {
    if pretty {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TRANSCODING: &str = r#"
name: video_transcoding
states:
  - name: new
    kind: initial
    transitions:
      - to: transcoding
        when: input.needs_transcode
        label: transcode
      - to: review
        when: "!input.needs_transcode"
  - name: transcoding
    settings:
      output:
        transcoded: "true"
    transitions:
      - to: ready
  - name: review
    kind: interactive
    transitions:
      - to: ready
        when: input.approved
  - name: ready
    kind: final
"#;

    fn write_definition(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("transcoding.yaml");
        std::fs::write(&path, TRANSCODING).unwrap();
        path
    }

    fn run(definition: PathBuf, input: &str, start: Option<&str>) -> Result<Value, CommandError> {
        let config = Config::default();
        let output = execute(
            Commands::Run {
                definition,
                input: Some(input.to_string()),
                start: start.map(str::to_string),
                max_cycles: None,
            },
            &config,
        )?;
        Ok(serde_json::from_str(&output).unwrap())
    }

    #[test]
    fn test_run_to_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(&dir);

        let output = run(path, r#"{"needs_transcode": true}"#, None).unwrap();
        assert_eq!(output["current_state"], "ready");
        assert_eq!(output["params"]["transcoded"], true);
    }

    #[test]
    fn test_run_pauses_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(&dir);

        let paused = run(path.clone(), r#"{"needs_transcode": false}"#, None).unwrap();
        assert_eq!(paused["current_state"], "review");

        let input_path = dir.path().join("input.json");
        let mut params = paused["params"].clone();
        params["approved"] = Value::Bool(true);
        std::fs::write(&input_path, params.to_string()).unwrap();

        let done = run(
            path,
            &format!("@{}", input_path.display()),
            Some("review"),
        )
        .unwrap();
        assert_eq!(done["current_state"], "ready");
    }

    #[test]
    fn test_run_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(&dir);

        let err = run(path.clone(), "[1, 2]", None).unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");

        let err = run(path.clone(), "{not json", None).unwrap_err();
        assert!(matches!(err, CommandError::Json(_)));

        let err = run(path, "@/definitely/missing.json", None).unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_run_at_final_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(&dir);

        let err = run(path, "{}", Some("ready")).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_EXECUTION_FLOW");
    }

    #[test]
    fn test_check_and_describe() {
        colored::control::set_override(false);
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(&dir);
        let config = Config::default();

        let summary = execute(Commands::Check { definition: path.clone() }, &config).unwrap();
        assert!(summary.contains("Valid machine video_transcoding"));
        assert!(summary.contains("States: 4 (initial: new, final: ready)"));
        assert!(summary.contains("Transitions: 4"));
        assert!(summary.contains("Max cycles: 20"));

        let description = execute(Commands::Describe { definition: path }, &config).unwrap();
        assert!(description.contains("new (initial)"));
        assert!(description.contains("review (interactive)"));
        assert!(description.contains("new -> transcoding [input.needs_transcode] (transcode)"));
        assert!(description.contains("transcoded = \"true\""));
    }

    #[test]
    fn test_check_reports_structure_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(
            &path,
            r#"{"name": "broken", "states": [{"name": "a", "kind": "initial", "transitions": [{"to": "b"}]}, {"name": "b"}]}"#,
        )
        .unwrap();

        let err = execute(Commands::Check { definition: path }, &Config::default()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STRUCTURE");
    }

    #[test]
    fn test_max_cycles_precedence() {
        let def = MachineDefinition::from_json(&serde_json::json!({
            "name": "m",
            "max_cycles": 3,
            "states": [
                {"name": "a", "kind": "initial", "transitions": [{"to": "b"}]},
                {"name": "b", "kind": "final"}
            ]
        }))
        .unwrap();
        let mut config = Config::default();
        config.execution.max_cycles = 9;

        assert_eq!(build(&def, &config, None).unwrap().max_cycles(), 3);
        assert_eq!(build(&def, &config, Some(5)).unwrap().max_cycles(), 5);

        let def = MachineDefinition::from_json(&serde_json::json!({
            "name": "m",
            "states": [
                {"name": "a", "kind": "initial", "transitions": [{"to": "b"}]},
                {"name": "b", "kind": "final"}
            ]
        }))
        .unwrap();
        assert_eq!(build(&def, &config, None).unwrap().max_cycles(), 9);
    }
}
