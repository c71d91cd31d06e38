//! Prelude module for common imports

pub use crate::cli::{PipelineArgs, run_pipeline};
pub use crate::executor::{RunReport, Runner};
pub use crate::infrastructure::{Config, InputRequest, InputValue, SecretRef};
pub use crate::pipeline::{
    Artifact, BuildParam, Command, CommandResult, Flow, Image, Pipeline, PipelineDef,
    PipelineError, PipelineState, Stage, StageSpec, StepResult, Triggers,
};
