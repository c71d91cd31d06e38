//! Stage executor
//!
//! A [`Stage`] exists only inside [`Pipeline::stage`](crate::pipeline::Pipeline::stage).
//! Commands either run in-process, in the main container when it uses the
//! stage's image, or in a fresh container that is removed before `run`
//! returns.

use crate::executor::{Batch, ContainerGuard};
use crate::infrastructure::{ContainerOptions, EventKind, InputRequest, InputValue};
use crate::pipeline::command::Command;
use crate::pipeline::controller::Pipeline;
use crate::pipeline::errors::{Flow, PipelineError, StepResult};
use crate::pipeline::image::Image;
use crate::pipeline::types::{CommandResult, StageRecord, StageState};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Mount point of the workspace inside stage containers
pub const WORKSPACE: &str = "/workspace";

/// Name and options of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Stage name, unique within a run
    pub name: String,
    /// Image override; the pipeline image is used when `None`
    pub image: Option<Image>,
    /// Advisory timeout
    pub timeout: Option<Duration>,
}

impl StageSpec {
    /// Stage named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            timeout: None,
        }
    }

    /// Runs the stage's commands in `image`
    #[must_use]
    pub fn image(mut self, image: impl Into<Image>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Warns when the stage takes longer than `timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for StageSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StageSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// One running stage
pub struct Stage<'p> {
    pipeline: &'p Pipeline,
    spec: StageSpec,
    image: Mutex<Option<String>>,
    started: Instant,
}

impl fmt::Debug for Stage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.spec.name)
            .field("image", &*self.image.lock())
            .field("elapsed", &self.started.elapsed())
            .finish_non_exhaustive()
    }
}

impl<'p> Stage<'p> {
    pub(crate) fn enter(pipeline: &'p Pipeline, spec: StageSpec) -> Self {
        let relay = &pipeline.services().relay;
        relay.set_current_stage(Some(&spec.name));
        relay.post_log(&format!("Entering stage {}", spec.name));
        relay.post_event(EventKind::StageEntered, json!({ "stage": spec.name }));
        pipeline.metrics().stage_entered();
        tracing::info!(stage = %spec.name, "Stage started");

        Self {
            pipeline,
            spec,
            image: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub(crate) fn resolve_image(&self) -> Result<(), PipelineError> {
        let image = match &self.spec.image {
            Some(image) => self.pipeline.resolve_image(image)?,
            None => self.pipeline.image().ok_or_else(|| {
                PipelineError::Definition("pipeline image was never resolved".into())
            })?,
        };
        *self.image.lock() = Some(image);
        Ok(())
    }

    pub(crate) fn exit(&self, fault: Option<&Flow>) -> StageRecord {
        let duration = self.started.elapsed();
        let relay = &self.pipeline.services().relay;
        let name = &self.spec.name;
        let secs = duration.as_secs_f64();

        let state = match fault {
            None => {
                relay.post_log(&format!("Stage {name} completed in {secs:.2}s"));
                relay.post_event(EventKind::StageCompleted, json!({ "stage": name, "duration_ms": duration.as_millis() as u64 }));
                tracing::info!(stage = %name, duration_ms = duration.as_millis() as u64, "Stage completed");
                StageState::Succeeded
            }
            Some(Flow::Stop { reason }) => {
                relay.post_log(&format!("Stage {name} stopped the pipeline after {secs:.2}s: {reason}"));
                relay.post_event(EventKind::StageSkipped, json!({ "stage": name, "reason": reason }));
                tracing::info!(stage = %name, %reason, "Stage requested early exit");
                StageState::SkippedByExit
            }
            Some(Flow::Fault(e)) => {
                relay.post_log(&format!("Stage {name} failed after {secs:.2}s: {e}"));
                relay.post_event(EventKind::StageFailed, json!({ "stage": name, "error": e.to_string() }));
                tracing::error!(stage = %name, error = %e, "Stage failed");
                StageState::Failed
            }
        };

        let overran = self.spec.timeout.is_some_and(|limit| duration > limit);
        if let Some(limit) = self.spec.timeout.filter(|_| overran) {
            relay.post_log(&format!(
                "Warning: stage {name} exceeded its timeout of {}s",
                limit.as_secs_f64()
            ));
            tracing::warn!(stage = %name, timeout_ms = limit.as_millis() as u64, duration_ms = duration.as_millis() as u64, "Stage exceeded its timeout");
        }

        self.pipeline.metrics().stage_finished(state);
        relay.set_current_stage(None);

        StageRecord {
            name: name.clone(),
            state,
            duration,
            overran,
        }
    }

    /// Stage name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Image commands run in
    #[must_use]
    pub fn image(&self) -> Option<String> {
        self.image.lock().clone()
    }

    /// Enclosing pipeline
    #[must_use]
    pub fn pipeline(&self) -> &'p Pipeline {
        self.pipeline
    }

    /// Time since the stage started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Posts a line to the relay
    pub fn log(&self, message: impl AsRef<str>) {
        self.pipeline.services().relay.post_log(message.as_ref());
    }

    /// Ends the pipeline early without failing it
    ///
    /// Return the value with `?` or directly from the stage body.
    #[allow(clippy::unused_self)]
    pub fn stop<T>(&self, reason: impl Into<String>) -> StepResult<T> {
        Err(Flow::stop(reason))
    }

    /// Runs a command
    ///
    /// A non-zero exit code is logged and returned in the result; it is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the container engine fails.
    pub fn run<'a>(&self, command: impl Into<Command<'a>>) -> Result<CommandResult, PipelineError> {
        match command.into() {
            Command::Call { name, func } => Ok(self.call(&name, func)),
            Command::Shell(command) => self.shell(&command),
        }
    }

    fn call(&self, name: &str, func: impl FnOnce() -> CommandResult) -> CommandResult {
        tracing::debug!(stage = %self.spec.name, call = %name, "Invoking callable");
        let result = func();
        self.report(&format!("call {name}"), &result);
        result
    }

    fn shell(&self, command: &str) -> Result<CommandResult, PipelineError> {
        let relay = &self.pipeline.services().relay;

        if self.pipeline.dry_run() {
            relay.post_log(&format!("[dry-run] would run: {command}"));
            return Ok(CommandResult::default());
        }

        let image = self.image().ok_or_else(|| {
            PipelineError::Definition(format!("stage {} has no image", self.spec.name))
        })?;
        relay.post_log(&format!("$ {command}"));

        let result = match self.pipeline.main_container_for(&image) {
            Some(main) => {
                tracing::debug!(stage = %self.spec.name, container = %main, "Running in main container");
                self.pipeline.services().runtime.exec(&main, command)?
            }
            None => self.run_in_fresh_container(&image, command)?,
        };

        self.report(command, &result);
        Ok(result)
    }

    fn run_in_fresh_container(&self, image: &str, command: &str) -> Result<CommandResult, PipelineError> {
        let runtime = self.pipeline.services().runtime.as_ref();
        let options = self.container_options();

        let handle = runtime.create_container(image, &options)?;
        self.pipeline.metrics().container_created();
        let guard = ContainerGuard::new(runtime, handle);

        tracing::debug!(stage = %self.spec.name, container = %guard.handle(), %image, "Created stage container");
        runtime.start(guard.handle())?;
        runtime.exec(guard.handle(), command)
    }

    fn container_options(&self) -> ContainerOptions {
        let slug = slug(&self.spec.name);
        let suffix = Uuid::new_v4().simple().to_string();
        let mut options = ContainerOptions::new()
            .with_name(format!("danube-{slug}-{}", &suffix[..8]))
            .with_label("danube.stage", self.spec.name.clone())
            .with_env("DANUBE_STAGE", self.spec.name.clone())
            .with_env("DANUBE_BRANCH", self.pipeline.branch());
        for (key, value) in self.pipeline.env() {
            options = options.with_env(key.clone(), value.clone());
        }
        if let Some(dir) = self.pipeline.workdir_mount() {
            options = options.with_volume(dir.clone(), WORKSPACE).with_working_dir(WORKSPACE);
        }
        options
    }

    fn report(&self, what: &str, result: &CommandResult) {
        let relay = &self.pipeline.services().relay;
        for line in result.output_lines() {
            relay.post_log(line);
        }
        self.pipeline.metrics().command_finished(result.is_success());

        if result.is_failure() {
            relay.post_log(&format!("Command exited with code {}: {what}", result.exit_code));
            relay.post_event(
                EventKind::CommandFailed,
                json!({ "command": what, "exit_code": result.exit_code, "stderr": result.stderr }),
            );
            tracing::warn!(stage = %self.spec.name, command = %what, exit_code = result.exit_code, "Command failed");
        }
    }

    /// Asks for interactive input
    ///
    /// Dry-run answers immediately without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputTimeout`] if no answer arrives in time.
    pub fn input(&self, request: &InputRequest) -> Result<InputValue, PipelineError> {
        if self.pipeline.dry_run() {
            let answer = request.dry_run_answer();
            self.log(format!("[dry-run] input {} answered with {answer:?}", request.name));
            return Ok(answer);
        }
        self.log(format!("Waiting for input {}: {}", request.name, request.description));
        let answer = self.pipeline.services().input.request(request)?;
        tracing::info!(stage = %self.spec.name, input = %request.name, "Input received");
        Ok(answer)
    }

    /// Asks a yes/no question
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputTimeout`] if no answer arrives in time.
    pub fn confirm(&self, name: &str, description: &str, timeout: Duration) -> Result<bool, PipelineError> {
        self.input(&InputRequest::confirm(name, description, timeout))
            .map(|value| value.is_confirmed())
    }

    /// Asks for a line of text
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputTimeout`] if no answer arrives in time.
    pub fn text(&self, name: &str, description: &str, timeout: Duration) -> Result<String, PipelineError> {
        self.input(&InputRequest::text(name, description, timeout))
            .map(|value| value.as_text().unwrap_or_default().to_string())
    }

    /// Runs sub-steps on the worker pool
    ///
    /// Every job submitted by `submit` has finished when this returns. The
    /// result is the first fault in submission order, else the first
    /// early-exit signal.
    pub fn parallel<'env, F>(&'env self, submit: F) -> StepResult
    where
        F: for<'q> FnOnce(&Batch<'q, 'env>),
    {
        let pool = self.pipeline.pool();
        tracing::debug!(stage = %self.spec.name, workers = pool.workers(), "Running parallel sub-steps");
        pool.scope(submit)
    }
}

/// Lowercase container-name-safe form of a stage name
fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() { "stage".to_string() } else { slug.to_string() }
}
