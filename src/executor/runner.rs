//! Composition root
//!
//! A [`Runner`] is built once at start-up with every collaborator passed in
//! explicitly, then runs pipelines one at a time.

use crate::executor::guard::CleanupGuard;
use crate::infrastructure::{
    CliRuntime, Config, ContainerRuntime, EnvSecretStore, HttpTransport, InputProvider, NoInput,
    Relay, RelayTransport, RunMetrics, SecretStore, StdinInput, TracingTransport,
};
use crate::pipeline::{
    ArtifactResolution, Flow, Pipeline, PipelineDef, PipelineError, PipelineState, RunSettings,
    Services, StageRecord, StepResult,
};
use serde::Serialize;
use std::io::IsTerminal;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Pipeline name
    pub name: String,
    /// Final state
    pub state: PipelineState,
    /// Fault description when the run failed
    pub error: Option<String>,
    /// Early-exit reason when the run stopped early
    pub stop_reason: Option<String>,
    /// Branch the run was for
    pub branch: String,
    /// Stages in the order they ran
    pub stages: Vec<StageRecord>,
    /// Artifacts resolved at exit
    pub artifacts: Vec<ArtifactResolution>,
    /// Counters
    pub metrics: RunMetrics,
}

impl RunReport {
    /// Returns true for `Completed` and `EarlyExit`
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    /// Process exit code for this outcome
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_success())
    }
}

/// Builder for [`Runner`]
#[derive(Default)]
pub struct RunnerBuilder {
    config: Option<Config>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    transport: Option<Arc<dyn RelayTransport>>,
    secrets: Option<Arc<dyn SecretStore>>,
    input: Option<Arc<dyn InputProvider>>,
    branch: Option<String>,
}

impl RunnerBuilder {
    /// Sets the configuration
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the container runtime
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the relay transport
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the secret store
    #[must_use]
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Sets the input provider
    #[must_use]
    pub fn input(mut self, input: Arc<dyn InputProvider>) -> Self {
        self.input = Some(input);
        self
    }

    /// Uses `branch` instead of detecting it from the environment
    #[must_use]
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Builds the runner, filling unset collaborators from the configuration
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Relay`] if the relay URL is invalid.
    pub fn build(self) -> Result<Runner, PipelineError> {
        let config = self.config.unwrap_or_default();

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Arc::new(CliRuntime::new(config.engine)),
        };

        let transport: Arc<dyn RelayTransport> = match (self.transport, &config.relay_url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => Arc::new(HttpTransport::new(url)?),
            (None, None) => Arc::new(TracingTransport),
        };

        let secrets = match self.secrets {
            Some(secrets) => secrets,
            None => Arc::new(EnvSecretStore::new(config.secret_prefix.clone())),
        };

        let input: Arc<dyn InputProvider> = match self.input {
            Some(input) => input,
            None if std::io::stdin().is_terminal() => Arc::new(StdinInput::new()),
            None => Arc::new(NoInput),
        };

        tracing::debug!(
            runtime = runtime.name(),
            relay = transport.name(),
            secrets = secrets.name(),
            "Runner assembled"
        );

        Ok(Runner {
            config,
            runtime,
            transport,
            secrets,
            input,
            branch: self.branch,
            active: AtomicBool::new(false),
        })
    }
}

/// Runs pipelines against one set of collaborators
///
/// At most one pipeline is active per runner; separate runners are
/// independent.
pub struct Runner {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    transport: Arc<dyn RelayTransport>,
    secrets: Arc<dyn SecretStore>,
    input: Arc<dyn InputProvider>,
    branch: Option<String>,
    active: AtomicBool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("runtime", &self.runtime.name())
            .field("relay", &self.transport.name())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Releases the active marker on every exit path
struct ActiveMarker<'a>(&'a AtomicBool);

impl Drop for ActiveMarker<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Runner {
    /// Starts a builder
    #[must_use]
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    /// Production runner for `config`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Relay`] if the relay URL is invalid.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        Self::builder().config(config).build()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Container runtime in use
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Returns true while a pipeline is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs one pipeline
    ///
    /// The pipeline is entered, `body` runs, and the pipeline is closed on
    /// every path. Whatever happens, every container the runtime still
    /// tracks is removed before this returns. A failing body is reported in
    /// the [`RunReport`], not as an error. A panicking body still gets the
    /// full close (artifacts, final status, job completion) before the panic
    /// resumes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyActive`] if this runner is busy, or a
    /// definition error if `def` is invalid.
    pub fn run<F>(&self, def: PipelineDef, body: F) -> Result<RunReport, PipelineError>
    where
        F: FnOnce(&Pipeline) -> StepResult,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::AlreadyActive);
        }
        let _active = ActiveMarker(&self.active);
        let _cleanup = CleanupGuard::new(self.runtime.as_ref());

        let branch = self
            .branch
            .clone()
            .unwrap_or_else(|| self.config.detect_branch());
        let settings = RunSettings::new(&self.config, &def, branch);
        let services = Services {
            runtime: Arc::clone(&self.runtime),
            relay: Arc::new(Relay::new(Arc::clone(&self.transport), self.config.retry)),
            secrets: Arc::clone(&self.secrets),
            input: Arc::clone(&self.input),
        };

        let pipeline = Pipeline::open(def, settings, services)?;
        let (outcome, panicked) = match pipeline.enter() {
            Ok(()) => match panic::catch_unwind(AssertUnwindSafe(|| body(&pipeline))) {
                Ok(outcome) => (outcome, None),
                Err(payload) => (
                    Err(Flow::Fault(PipelineError::from_panic(payload.as_ref()))),
                    Some(payload),
                ),
            },
            Err(e) => (Err(e.into()), None),
        };
        let closing = pipeline.close(outcome);
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }

        Ok(RunReport {
            run_id: pipeline.id(),
            name: pipeline.name().to_string(),
            state: closing.state,
            error: closing.error,
            stop_reason: closing.stop_reason,
            branch: pipeline.branch().to_string(),
            stages: closing.stages,
            artifacts: closing.artifacts,
            metrics: closing.metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{EventKind, MemoryTransport, StaticSecretStore};
    use crate::pipeline::{Flow, StageState};
    use crate::testing::{FakeRuntime, Harness};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_exit_code() {
        let harness = Harness::new();
        let report = harness
            .runner()
            .run(PipelineDef::new("alpine"), |_| Ok(()))
            .unwrap();

        assert_eq!(report.state, PipelineState::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.branch, "main");
    }

    #[test]
    fn test_failed_body_is_reported_not_returned() {
        let harness = Harness::new();
        let report = harness
            .runner()
            .run(PipelineDef::new("alpine"), |_| {
                Err(PipelineError::other("boom").into())
            })
            .unwrap();

        assert_eq!(report.state, PipelineState::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_second_run_on_busy_runner_is_rejected() {
        let harness = Harness::new();
        let runner = harness.runner();

        let inner = runner
            .run(PipelineDef::new("alpine"), |_| {
                let nested = runner.run(PipelineDef::new("alpine"), |_| Ok(()));
                assert_eq!(nested.unwrap_err(), PipelineError::AlreadyActive);
                Ok(())
            })
            .unwrap();

        assert_eq!(inner.state, PipelineState::Completed);
        assert!(!runner.is_active());
    }

    #[test]
    fn test_separate_runners_are_independent() {
        let first = Harness::new();
        let second = Harness::new();
        let runner = first.runner();
        let other = second.runner();

        let report = runner
            .run(PipelineDef::new("alpine"), |_| {
                let nested = other.run(PipelineDef::new("alpine"), |_| Ok(())).unwrap();
                assert_eq!(nested.state, PipelineState::Completed);
                Ok(())
            })
            .unwrap();
        assert!(report.is_success());
    }

    #[test]
    fn test_invalid_definition_is_an_error() {
        let harness = Harness::new();
        let err = harness
            .runner()
            .run(PipelineDef::new("alpine").name(""), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Definition(_)));
        assert!(harness.transport.events().is_empty());
    }

    #[test]
    fn test_leftover_containers_removed_after_panic() {
        let harness = Harness::new();
        let runner = harness.runner();
        let runtime = Arc::clone(&harness.runtime);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runner.run(PipelineDef::new("alpine"), |_| {
                runtime
                    .create_container("alpine", &Default::default())
                    .unwrap();
                panic!("pipeline code panicked");
            })
        }));

        assert!(outcome.is_err());
        assert!(harness.runtime.registry().is_empty());
        assert!(!runner.is_active());

        let finished = harness.transport.events_of(EventKind::PipelineFinished);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].payload["error"], "panicked: pipeline code panicked");
        assert_eq!(harness.transport.jobs(), vec![("job-1".to_string(), true)]);
    }

    #[test]
    fn test_build_failure_fails_run_before_stages() {
        let harness = Harness::with_runtime(FakeRuntime::new().failing_build("RUN make: exit 2"));
        let report = harness
            .runner()
            .run(PipelineDef::new(crate::pipeline::Image::file("ci/Dockerfile")), |p| {
                p.stage("never", |_| Ok(()))
            })
            .unwrap();

        assert_eq!(report.state, PipelineState::Failed);
        assert!(report.error.unwrap().contains("RUN make"));
        assert!(report.stages.is_empty());
    }

    #[test]
    fn test_builder_uses_injected_collaborators() {
        let transport = Arc::new(MemoryTransport::new());
        let runner = Runner::builder()
            .runtime(Arc::new(FakeRuntime::new()))
            .transport(transport.clone())
            .secrets(Arc::new(StaticSecretStore::new()))
            .input(Arc::new(NoInput))
            .branch("release")
            .build()
            .unwrap();

        let report = runner
            .run(PipelineDef::new("alpine"), |p| {
                p.stage("gate", |s| s.stop(format!("branch {}", s.pipeline().branch())))
            })
            .unwrap();

        assert_eq!(report.state, PipelineState::EarlyExit);
        assert_eq!(report.stop_reason.as_deref(), Some("branch release"));
        assert_eq!(report.stages[0].state, StageState::SkippedByExit);
        assert_eq!(transport.events_of(EventKind::PipelineFinished).len(), 1);
        assert_eq!(transport.jobs(), vec![("job-1".to_string(), true)]);
    }

    #[test]
    fn test_invalid_relay_url_fails_build() {
        let config = Config {
            relay_url: Some("not a url".into()),
            ..Config::default()
        };
        assert!(matches!(
            Runner::from_config(config).unwrap_err(),
            PipelineError::Relay(_)
        ));
    }

    #[test]
    fn test_stop_signal_helper_matches_flow() {
        let harness = Harness::new();
        let report = harness
            .runner()
            .run(PipelineDef::new("alpine"), |_| Err(Flow::stop("not today")))
            .unwrap();
        assert_eq!(report.state, PipelineState::EarlyExit);
        assert_eq!(report.exit_code(), 0);
    }
}
