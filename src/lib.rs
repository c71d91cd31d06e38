//! # Danube - container-based CI/CD pipelines in Rust
//!
//! Danube runs a pipeline written as ordinary Rust code. Each stage's shell
//! commands execute in containers (Docker or Podman), in-process callables
//! run directly, and every log line and status change is relayed to a
//! collector.
//!
//! ## Quick Start
//!
//! ```no_run
//! use danube::prelude::*;
//!
//! let def = PipelineDef::new("python:3.11-slim")
//!     .name("danube")
//!     .param(BuildParam::bool("DEPLOY", "Deploy after the build", false));
//!
//! let report = Runner::from_config(Config::from_env())?.run(def, |p| {
//!     p.stage("Lint", |s| {
//!         s.run("ruff check .")?;
//!         Ok(())
//!     })?;
//!     p.stage("Deploy", |s| {
//!         if !p.params().bool("DEPLOY")? {
//!             return s.stop("deployment not requested");
//!         }
//!         s.run("./deploy.sh")?;
//!         Ok(())
//!     })
//! })?;
//! std::process::exit(i32::from(report.exit_code()));
//! # Ok::<(), PipelineError>(())
//! ```
//!
//! ## Features
//!
//! - **Scoped stages**: containers are reclaimed on every exit path
//! - **Early exit**: [`Flow::Stop`](pipeline::Flow) ends a run without failing it
//! - **Parallel sub-steps**: a bounded worker pool joined before the stage ends
//! - **Dry run**: no container, secret or input side effects
//! - **Log relay**: HTTP collector with retry, or local `tracing` output

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cli;
pub mod executor;
pub mod infrastructure;
pub mod pipeline;

// Prelude module for common imports
pub mod prelude;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{RunReport, Runner, RunnerBuilder};
pub use infrastructure::{CliRuntime, Config, ContainerRuntime, Engine, init_logging};
pub use pipeline::{
    Artifact, BuildParam, BuildParams, Command, CommandResult, Flow, Image, Pipeline, PipelineDef,
    PipelineError, PipelineState, Stage, StageSpec, StepResult, Triggers, Validate,
};

/// Version of the danube crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
