//! Command-line surface
//!
//! Two halves: the `danube` binary's maintenance commands, and
//! [`PipelineArgs`]/[`run_pipeline`] for pipeline programs.
//!
//! - `doctor`: check the container engine and the log collector
//! - `cleanup`: remove containers left behind by earlier runs
//! - `logs`: print a container's log as the collector recorded it
//! - `completions`: generate shell completions

mod args;
pub mod cleanup;
pub mod completions;
pub mod doctor;
pub mod logs;

pub use args::{PipelineArgs, format_report, run_pipeline};

use crate::infrastructure::{CliRuntime, Config, Engine, init_logging};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// CLI arguments for danube
#[derive(Parser, Debug)]
#[command(name = "danube")]
#[command(author, version, about = "Container-based CI/CD pipeline runner", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the container engine and the log collector
    Doctor,

    /// Remove every container labelled danube.managed=true
    Cleanup {
        /// Container engine (docker or podman)
        #[arg(short, long)]
        engine: Option<Engine>,
        /// List the containers without removing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Print a container's log as stored by the collector
    Logs {
        /// Container id
        container: String,
    },

    /// Print a completion script for SHELL
    Completions {
        #[arg(value_enum)]
        shell: Shell,
        /// Write the script here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

/// Build the CLI command for completion generation
#[must_use]
pub fn build_cli() -> clap::Command {
    Args::command()
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env();
    Ok(config)
}

/// Parse and execute CLI arguments
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    match args.command {
        Command::Doctor => {
            let diagnosis = doctor::diagnose(&config)?;
            println!("{}", doctor::format_diagnosis(config.engine.program(), &diagnosis));
            if !diagnosis.is_operational() {
                anyhow::bail!("danube cannot run pipelines in this environment");
            }
        }
        Command::Cleanup { engine, dry_run } => {
            let runtime = CliRuntime::new(engine.unwrap_or(config.engine));
            let count = cleanup::cleanup(&runtime, dry_run)?;
            if dry_run {
                println!("{count} managed container(s) found");
            } else {
                println!("Removed {count} managed container(s)");
            }
        }
        Command::Logs { container } => {
            logs::show_logs(&config, &container, &mut std::io::stdout().lock())?;
        }
        Command::Completions { shell, output } => {
            completions::emit(shell, output.as_deref())?;
        }
    }

    Ok(())
}
