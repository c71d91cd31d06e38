//! Pipeline controller
//!
//! A [`Pipeline`] is the handle pipeline code receives for one run. It owns
//! the run-wide state (resolved image, branch, parameters, secret cache,
//! artifact registry) and drives the `NotStarted -> Active -> {Completed,
//! EarlyExit, Failed}` lifecycle. Entering and closing are done by the
//! runner; pipeline code only sees an active pipeline.

use crate::executor::WorkerPool;
use crate::infrastructure::{
    Config, ContainerHandle, ContainerRuntime, EventKind, InputProvider, LogFollower,
    MetricsCollector, Relay, RunMetrics, SecretStore, SecretString,
};
use crate::pipeline::artifacts::{Artifact, ArtifactRegistry, ArtifactResolution};
use crate::pipeline::errors::{Flow, PipelineError, StepResult};
use crate::pipeline::image::Image;
use crate::pipeline::params::BuildParams;
use crate::pipeline::pipeline_def::PipelineDef;
use crate::pipeline::stage::{Stage, StageSpec};
use crate::pipeline::types::{PipelineState, StageRecord, Validate};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Collaborators a pipeline talks to
#[derive(Clone)]
pub struct Services {
    /// Container engine
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Log relay
    pub relay: Arc<Relay>,
    /// Secret store
    pub secrets: Arc<dyn SecretStore>,
    /// Interactive input
    pub input: Arc<dyn InputProvider>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("runtime", &self.runtime.name())
            .field("relay", &self.relay)
            .field("secrets", &self.secrets.name())
            .finish_non_exhaustive()
    }
}

/// Run-level settings taken from the configuration
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub dry_run: bool,
    pub branch: String,
    pub workers: usize,
    pub main_container: bool,
    pub workdir_mount: Option<PathBuf>,
    pub relay_url: Option<String>,
}

impl RunSettings {
    pub(crate) fn new(config: &Config, def: &PipelineDef, branch: String) -> Self {
        Self {
            dry_run: def.dry_run.unwrap_or(config.dry_run),
            branch,
            workers: config.workers,
            main_container: config.main_container,
            workdir_mount: config.workdir_mount.clone(),
            relay_url: config.relay_url.clone(),
        }
    }
}

/// Everything a closed pipeline reports
#[derive(Debug)]
pub(crate) struct Closing {
    pub state: PipelineState,
    pub error: Option<String>,
    pub stop_reason: Option<String>,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactResolution>,
    pub metrics: RunMetrics,
}

struct MainContainer {
    handle: ContainerHandle,
    image: String,
}

/// One active pipeline run
pub struct Pipeline {
    id: Uuid,
    def: PipelineDef,
    settings: RunSettings,
    services: Services,
    pool: WorkerPool,
    state: Mutex<PipelineState>,
    image: Mutex<Option<String>>,
    built_images: Mutex<HashMap<Image, String>>,
    main: Mutex<Option<MainContainer>>,
    followers: Mutex<Vec<LogFollower>>,
    secrets: Mutex<HashMap<String, SecretString>>,
    artifacts: ArtifactRegistry,
    active_stage: Mutex<Option<String>>,
    stages: Mutex<Vec<StageRecord>>,
    stop_reason: Mutex<Option<String>>,
    job_id: Mutex<Option<String>>,
    metrics: MetricsCollector,
    started: Instant,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("name", &self.def.name)
            .field("branch", &self.settings.branch)
            .field("dry_run", &self.settings.dry_run)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Validates the definition and prepares a run; nothing external happens yet
    pub(crate) fn open(
        def: PipelineDef,
        settings: RunSettings,
        services: Services,
    ) -> Result<Self, PipelineError> {
        def.validate()?;

        let base_dir = match &settings.workdir_mount {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            pool: WorkerPool::new(settings.workers),
            artifacts: ArtifactRegistry::new(base_dir),
            def,
            settings,
            services,
            state: Mutex::new(PipelineState::NotStarted),
            image: Mutex::new(None),
            built_images: Mutex::new(HashMap::new()),
            main: Mutex::new(None),
            followers: Mutex::new(Vec::new()),
            secrets: Mutex::new(HashMap::new()),
            active_stage: Mutex::new(None),
            stages: Mutex::new(Vec::new()),
            stop_reason: Mutex::new(None),
            job_id: Mutex::new(None),
            metrics: MetricsCollector::new(),
            started: Instant::now(),
        })
    }

    /// `NotStarted -> Active`: builds the base image and starts the main container
    ///
    /// The state is `Active` even when this fails, so closing reports `Failed`.
    pub(crate) fn enter(&self) -> Result<(), PipelineError> {
        *self.state.lock() = PipelineState::Active;
        let relay = &self.services.relay;

        *self.job_id.lock() = relay.start_job(&json!({
            "pipeline": self.def.name,
            "run_id": self.id.to_string(),
            "image": self.def.image.to_string(),
            "branch": self.settings.branch,
        }));

        tracing::info!(
            pipeline = %self.def.name,
            run_id = %self.id,
            branch = %self.settings.branch,
            dry_run = self.settings.dry_run,
            "Pipeline started"
        );
        relay.post_log(&format!(
            "Starting pipeline {} on branch {}{}",
            self.def.name,
            self.settings.branch,
            if self.settings.dry_run { " (dry run)" } else { "" }
        ));
        relay.post_event(
            EventKind::PipelineStarted,
            json!({ "pipeline": self.def.name, "branch": self.settings.branch }),
        );

        let image = self.resolve_image(&self.def.image)?;
        *self.image.lock() = Some(image.clone());

        if self.settings.main_container && !self.settings.dry_run {
            self.start_main_container(image)?;
        }
        Ok(())
    }

    fn start_main_container(&self, image: String) -> Result<(), PipelineError> {
        let mut env = self.def.env.clone();
        if let Some(url) = &self.settings.relay_url {
            env.insert("DANUBE_SERVER_URL".into(), url.clone());
        }

        let runtime = &self.services.runtime;
        let handle = runtime.run_detached(&image, &env, &self.def.ports)?;
        match self
            .services
            .relay
            .follow(Arc::clone(runtime), handle.clone())
        {
            Ok(follower) => self.followers.lock().push(follower),
            Err(e) => tracing::warn!(container = %handle, error = %e, "Could not follow main container logs"),
        }
        *self.main.lock() = Some(MainContainer { handle, image });
        Ok(())
    }

    /// Resolves an image reference, building file images once per run
    pub(crate) fn resolve_image(&self, image: &Image) -> Result<String, PipelineError> {
        if let Some(id) = self.built_images.lock().get(image) {
            return Ok(id.clone());
        }
        let id = image.resolve(self.services.runtime.as_ref(), self.settings.dry_run)?;
        self.built_images.lock().insert(image.clone(), id.clone());
        Ok(id)
    }

    /// Closes the run: flushes artifacts, tears down the main container,
    /// drains log followers and reports the final status
    pub(crate) fn close(&self, outcome: StepResult) -> Closing {
        let (state, error) = match outcome {
            Ok(()) if self.stop_reason.lock().is_some() => (PipelineState::EarlyExit, None),
            Ok(()) => (PipelineState::Completed, None),
            Err(Flow::Stop { reason }) => {
                self.stop_reason.lock().get_or_insert(reason);
                (PipelineState::EarlyExit, None)
            }
            Err(Flow::Fault(e)) => (PipelineState::Failed, Some(e.to_string())),
        };

        let relay = &self.services.relay;
        relay.set_current_stage(None);

        let artifacts = self.flush_artifacts();
        self.teardown_main_container();

        let stop_reason = self.stop_reason.lock().clone();
        let duration = self.started.elapsed();
        let status_line = match (&state, &error, &stop_reason) {
            (PipelineState::Failed, Some(e), _) => format!("Pipeline Failed: {e}"),
            (PipelineState::EarlyExit, _, Some(reason)) => format!("Pipeline EarlyExit: {reason}"),
            _ => format!("Pipeline {state}"),
        };
        match state {
            PipelineState::Failed => {
                tracing::error!(pipeline = %self.def.name, error = error.as_deref().unwrap_or(""), "Pipeline failed");
            }
            _ => {
                tracing::info!(pipeline = %self.def.name, %state, duration_ms = duration.as_millis() as u64, "Pipeline finished");
            }
        }
        relay.post_log(&format!("{status_line} ({:.2}s)", duration.as_secs_f64()));
        relay.post_event(
            EventKind::PipelineFinished,
            json!({
                "status": state.to_string(),
                "error": error,
                "reason": stop_reason,
                "duration_ms": duration.as_millis() as u64,
            }),
        );
        if let Some(job_id) = self.job_id.lock().take() {
            relay.complete_job(&job_id);
        }

        *self.state.lock() = state;
        Closing {
            state,
            error,
            stop_reason,
            stages: self.stages.lock().clone(),
            artifacts,
            metrics: self.metrics.snapshot(duration),
        }
    }

    fn flush_artifacts(&self) -> Vec<ArtifactResolution> {
        let relay = &self.services.relay;
        let resolved = self.artifacts.resolve_all();
        for artifact in &resolved {
            if artifact.is_empty() {
                relay.post_log(&format!(
                    "Warning: no files found for artifact {} matching {}",
                    artifact.name, artifact.pattern
                ));
                relay.post_event(
                    EventKind::ArtifactMissing,
                    json!({ "name": artifact.name, "pattern": artifact.pattern }),
                );
            } else {
                relay.post_event(
                    EventKind::ArtifactSaved,
                    json!({ "name": artifact.name, "pattern": artifact.pattern, "files": artifact.files }),
                );
            }
        }
        resolved
    }

    fn teardown_main_container(&self) {
        let runtime = &self.services.runtime;
        if let Some(main) = self.main.lock().take() {
            if let Err(e) = runtime.stop(&main.handle) {
                tracing::warn!(container = %main.handle, error = %e, "Failed to stop main container");
            }
            if let Err(e) = runtime.remove(&main.handle) {
                tracing::warn!(container = %main.handle, error = %e, "Failed to remove main container");
            }
        }
        for follower in self.followers.lock().drain(..) {
            let container = follower.container().clone();
            let lines = follower.join();
            tracing::debug!(container = %container, lines, "Log follower drained");
        }
    }

    /// Unique identifier of this run
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pipeline name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Detected source-control branch
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.settings.branch
    }

    /// Returns true in dry-run mode
    #[must_use]
    pub fn dry_run(&self) -> bool {
        self.settings.dry_run
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Resolved base image
    #[must_use]
    pub fn image(&self) -> Option<String> {
        self.image.lock().clone()
    }

    /// Build parameters with overrides applied
    #[must_use]
    pub fn params(&self) -> &BuildParams {
        &self.def.params
    }

    /// Environment passed to containers
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.def.env
    }

    /// Returns true if the detected branch matches the triggers
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.def.triggers.matches_branch(&self.settings.branch)
    }

    /// Returns true if `event` matches the triggers
    #[must_use]
    pub fn is_triggered_by(&self, event: &str) -> bool {
        self.is_triggered() && self.def.triggers.matches_event(event)
    }

    /// Looks up a secret, caching it for the rest of the run
    ///
    /// In dry-run mode a placeholder is returned and the store is never
    /// contacted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Secret`] if the store cannot provide it.
    pub fn get_secret(&self, name: &str) -> Result<SecretString, PipelineError> {
        if let Some(value) = self.secrets.lock().get(name) {
            return Ok(value.clone());
        }

        let value = if self.settings.dry_run {
            SecretString::new(format!("<dry-run secret {name}>"))
        } else {
            let key = self.def.secret_key(name);
            let value = self.services.secrets.fetch(key)?;
            tracing::info!(secret = %name, store = self.services.secrets.name(), "Secret resolved");
            value
        };

        self.secrets
            .lock()
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Records an artifact to collect when the pipeline closes
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Artifact`] if the pattern is not a valid glob.
    pub fn save_artifact(&self, name: &str, pattern: &str) -> Result<(), PipelineError> {
        self.save(Artifact::new(name, pattern))
    }

    /// Records an artifact with options
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Artifact`] if the pattern is not a valid glob.
    pub fn save(&self, artifact: Artifact) -> Result<(), PipelineError> {
        self.services
            .relay
            .post_log(&format!("Saving artifact {} from {}", artifact.name, artifact.pattern));
        self.artifacts.save(artifact)
    }

    /// Artifacts saved so far
    #[must_use]
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.saved()
    }

    /// Reason the run is stopping early, if it is
    #[must_use]
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }

    /// Runs one stage
    ///
    /// The stage is entered, `body` runs, and the stage is closed on every
    /// path. An early-exit signal from `body` marks the stage skipped and is
    /// returned so `?` ends the pipeline body; the pipeline boundary turns
    /// it into `EarlyExit`. A panic in `body` closes the stage as failed and
    /// then resumes unwinding.
    ///
    /// # Errors
    ///
    /// Returns whatever `body` returns, or a fault if the stage cannot be
    /// entered.
    pub fn stage<T, F>(&self, spec: impl Into<StageSpec>, body: F) -> StepResult<T>
    where
        F: FnOnce(&Stage<'_>) -> StepResult<T>,
    {
        let spec = spec.into();

        if let Some(reason) = self.stop_reason() {
            tracing::debug!(stage = %spec.name, "Not entering stage, pipeline is stopping");
            return Err(Flow::Stop { reason });
        }
        self.claim_stage(&spec.name)?;

        let stage = Stage::enter(self, spec);
        let (outcome, panicked) = match stage.resolve_image() {
            Ok(()) => match panic::catch_unwind(AssertUnwindSafe(|| body(&stage))) {
                Ok(outcome) => (outcome, None),
                Err(payload) => (
                    Err(Flow::Fault(PipelineError::from_panic(payload.as_ref()))),
                    Some(payload),
                ),
            },
            Err(e) => (Err(e.into()), None),
        };
        let record = stage.exit(outcome.as_ref().err());

        *self.active_stage.lock() = None;
        self.stages.lock().push(record);

        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
        if let Err(Flow::Stop { reason }) = &outcome {
            self.stop_reason.lock().get_or_insert_with(|| reason.clone());
        }
        outcome
    }

    fn claim_stage(&self, name: &str) -> Result<(), PipelineError> {
        let mut active = self.active_stage.lock();
        if let Some(current) = active.as_deref() {
            return Err(PipelineError::Definition(format!(
                "stage '{name}' entered while '{current}' is still running"
            )));
        }
        if self.stages.lock().iter().any(|s| s.name == name) {
            return Err(PipelineError::Definition(format!(
                "stage name '{name}' already used in this run"
            )));
        }
        *active = Some(name.to_string());
        Ok(())
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn pool(&self) -> WorkerPool {
        self.pool
    }

    pub(crate) fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub(crate) fn workdir_mount(&self) -> Option<&PathBuf> {
        self.settings.workdir_mount.as_ref()
    }

    /// Main container, if it runs `image`
    pub(crate) fn main_container_for(&self, image: &str) -> Option<ContainerHandle> {
        self.main
            .lock()
            .as_ref()
            .filter(|main| main.image == image)
            .map(|main| main.handle.clone())
    }
}
