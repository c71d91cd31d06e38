//! Pipeline domain types and logic
//!
//! Pipeline code receives a [`Pipeline`] from [`Runner::run`](crate::executor::Runner::run)
//! and opens stages on it:
//!
//! ```no_run
//! use danube::prelude::*;
//!
//! let runner = Runner::from_config(Config::from_env())?;
//! let def = PipelineDef::new("python:3.11-slim").name("ci");
//! let report = runner.run(def, |p| {
//!     p.stage("Test", |s| {
//!         let result = s.run("pytest -q")?;
//!         if result.is_failure() {
//!             return s.stop("tests failed");
//!         }
//!         Ok(())
//!     })?;
//!     p.save_artifact("coverage", "htmlcov/*.html")?;
//!     Ok(())
//! })?;
//! assert!(report.is_success());
//! # Ok::<(), danube::pipeline::PipelineError>(())
//! ```

pub mod artifacts;
pub mod command;
pub mod controller;
pub mod errors;
pub mod image;
pub mod params;
pub mod pipeline_def;
pub mod stage;
pub mod triggers;
pub mod types;


pub use artifacts::{Artifact, ArtifactRegistry, ArtifactResolution};
pub use command::Command;
pub use controller::{Pipeline, Services};
pub(crate) use controller::RunSettings;
pub use errors::{Flow, PipelineError, StepResult};
pub use image::Image;
pub use params::{BuildParam, BuildParams, ParamKind, ParamValue, parse_override};
pub use pipeline_def::PipelineDef;
pub use stage::{Stage, StageSpec, WORKSPACE};
pub use triggers::Triggers;
pub use types::{CommandResult, PipelineState, StageRecord, StageState, Validate};
