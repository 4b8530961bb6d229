//! stepwise - deterministic state machine runner
//!
//! Loads machine definitions from JSON or YAML and executes, checks or
//! describes them.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Run and inspect deterministic state machines")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Log every execution step
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a machine until it reaches a final state or a breakpoint
    Run {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,

        /// Input parameters as JSON (or @file.json to read from file)
        #[arg(short, long)]
        input: Option<String>,

        /// State to start from (defaults to the initial state)
        #[arg(short, long)]
        start: Option<String>,

        /// Maximum visits of a single state
        #[arg(long)]
        max_cycles: Option<usize>,
    },

    /// Validate a definition and print a summary
    Check {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,
    },

    /// Print states and transitions of a definition
    Describe {
        /// Definition file (.json, .yaml or .yml)
        definition: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    if cli.trace {
        config.execution.trace = true;
    }

    // Initialize logging
    let default_level = if config.execution.trace {
        "info"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("Loaded config from {}", path.display());
    }

    match commands::execute(cli.command, &config) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{} [{}]: {}", "Error".red(), e.error_code(), e);
            std::process::exit(1);
        }
    }
}
