//! Test doubles shared by unit and scenario tests

use crate::executor::Runner;
use crate::infrastructure::{
    Config, ContainerHandle, ContainerOptions, ContainerRegistry, ContainerRuntime, HealthStatus,
    InputProvider, InputRequest, InputValue, LogStream, MemoryTransport, PortBinding, RetryPolicy,
    StaticSecretStore,
};
use crate::pipeline::{CommandResult, PipelineError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Container runtime that records every call and runs nothing
#[derive(Debug, Default)]
pub struct FakeRuntime {
    registry: ContainerRegistry,
    calls: Mutex<Vec<String>>,
    created: Mutex<Vec<ContainerHandle>>,
    removed: Mutex<Vec<String>>,
    execs: Mutex<Vec<(String, String)>>,
    options: Mutex<Vec<ContainerOptions>>,
    log_lines: Vec<String>,
    build_failure: Option<String>,
    exit_codes: HashMap<String, i32>,
    fail_create: bool,
    unavailable: bool,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines every log stream yields
    pub fn with_log_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Image builds fail with `log`
    pub fn failing_build(mut self, log: impl Into<String>) -> Self {
        self.build_failure = Some(log.into());
        self
    }

    /// `command` exits with `code`
    pub fn with_exit_code(mut self, command: impl Into<String>, code: i32) -> Self {
        self.exit_codes.insert(command.into(), code);
        self
    }

    /// Container creation fails
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Engine is unreachable
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    fn record(&self, op: &str) {
        self.calls.lock().push(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_named(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == op).count()
    }

    /// Every container created, main container included
    pub fn created(&self) -> Vec<ContainerHandle> {
        self.created.lock().clone()
    }

    /// Ids actually removed, each once
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    /// Options passed to each `create_container`
    pub fn options(&self) -> Vec<ContainerOptions> {
        self.options.lock().clone()
    }

    /// `(container id, command)` for each exec
    pub fn execs(&self) -> Vec<(String, String)> {
        self.execs.lock().clone()
    }

    fn allocate(&self, image: &str, name: Option<&str>) -> ContainerHandle {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{n:064x}");
        let name = name.map_or_else(|| format!("fake-{n}"), str::to_string);
        let handle = ContainerHandle::new(id, name, image);
        self.registry.register(&handle);
        self.created.lock().push(handle.clone());
        handle
    }

    fn check_available(&self) -> Result<(), PipelineError> {
        if self.unavailable {
            return Err(PipelineError::RuntimeUnavailable("fake engine is down".into()));
        }
        Ok(())
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn health_check(&self) -> HealthStatus {
        if self.unavailable {
            HealthStatus::Unhealthy {
                reason: "fake engine is down".into(),
            }
        } else {
            HealthStatus::Healthy
        }
    }

    fn build_image(&self, _context: &Path, dockerfile: &Path) -> Result<String, PipelineError> {
        self.record("build");
        self.check_available()?;
        match &self.build_failure {
            Some(log) => Err(PipelineError::Build {
                dockerfile: dockerfile.display().to_string(),
                log: log.clone(),
            }),
            None => Ok(format!("sha256:{:x}", self.calls_named("build"))),
        }
    }

    fn create_container(
        &self,
        image: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerHandle, PipelineError> {
        self.record("create");
        self.check_available()?;
        if self.fail_create {
            return Err(PipelineError::container("create", "no space left on device"));
        }
        self.options.lock().push(options.clone());
        Ok(self.allocate(image, options.name.as_deref()))
    }

    fn start(&self, _handle: &ContainerHandle) -> Result<(), PipelineError> {
        self.record("start");
        self.check_available()
    }

    fn run_detached(
        &self,
        image: &str,
        _env: &BTreeMap<String, String>,
        _ports: &[PortBinding],
    ) -> Result<ContainerHandle, PipelineError> {
        self.record("run");
        self.check_available()?;
        Ok(self.allocate(image, Some("danube-main")))
    }

    fn exec(&self, handle: &ContainerHandle, command: &str) -> Result<CommandResult, PipelineError> {
        self.record("exec");
        self.check_available()?;
        self.execs
            .lock()
            .push((handle.id.clone(), command.to_string()));

        let code = self.exit_codes.get(command).copied().unwrap_or(0);
        let stdout = command
            .strip_prefix("echo ")
            .map(|text| format!("{text}\n"))
            .unwrap_or_default();
        let stderr = if code == 0 {
            String::new()
        } else {
            format!("{command}: exit {code}\n")
        };
        Ok(CommandResult::new(stdout, stderr, code))
    }

    fn stop(&self, _handle: &ContainerHandle) -> Result<(), PipelineError> {
        self.record("stop");
        Ok(())
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<(), PipelineError> {
        self.record("remove");
        if self.registry.unregister(&handle.id) {
            self.removed.lock().push(handle.id.clone());
        }
        Ok(())
    }

    fn stream_logs(&self, _handle: &ContainerHandle) -> Result<LogStream, PipelineError> {
        self.record("logs");
        Ok(LogStream::new(self.log_lines.clone().into_iter()))
    }

    fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }
}

/// Input provider answering from a script; `None` entries time out
#[derive(Debug, Default)]
pub struct ScriptedInput {
    answers: Mutex<VecDeque<Option<InputValue>>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, value: InputValue) -> Self {
        self.answers.lock().push_back(Some(value));
        self
    }

    pub fn time_out(self) -> Self {
        self.answers.lock().push_back(None);
        self
    }

    /// Names of the requests received
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl InputProvider for ScriptedInput {
    fn request(&self, request: &InputRequest) -> Result<InputValue, PipelineError> {
        self.asked.lock().push(request.name.clone());
        match self.answers.lock().pop_front().flatten() {
            Some(value) => Ok(value),
            None => Err(PipelineError::InputTimeout {
                name: request.name.clone(),
                seconds: request.timeout.as_secs(),
            }),
        }
    }
}

/// Runner wired to fakes, with a temporary workspace
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub transport: Arc<MemoryTransport>,
    pub secrets: Arc<StaticSecretStore>,
    pub input: Arc<ScriptedInput>,
    pub config: Config,
    pub workdir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_runtime(FakeRuntime::new())
    }

    pub fn with_runtime(runtime: FakeRuntime) -> Self {
        let workdir = tempfile::tempdir().unwrap();
        let config = Config {
            retry: RetryPolicy::none(),
            workdir_mount: Some(workdir.path().to_path_buf()),
            ..Config::default()
        };
        Self {
            runtime: Arc::new(runtime),
            transport: Arc::new(MemoryTransport::new()),
            secrets: Arc::new(StaticSecretStore::new()),
            input: Arc::new(ScriptedInput::new()),
            config,
            workdir,
        }
    }

    pub fn with_secrets(mut self, secrets: StaticSecretStore) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    pub fn with_input(mut self, input: ScriptedInput) -> Self {
        self.input = Arc::new(input);
        self
    }

    pub fn configure(mut self, change: impl FnOnce(&mut Config)) -> Self {
        change(&mut self.config);
        self
    }

    /// Writes `contents` to `path` under the workspace
    pub fn write_file(&self, path: &str, contents: &str) {
        let path = self.workdir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn runner(&self) -> Runner {
        Runner::builder()
            .config(self.config.clone())
            .runtime(self.runtime.clone())
            .transport(self.transport.clone())
            .secrets(self.secrets.clone())
            .input(self.input.clone())
            .branch("main")
            .build()
            .unwrap()
    }

    /// Log lines that contain `needle`
    pub fn logs_containing(&self, needle: &str) -> Vec<String> {
        self.transport
            .logs()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }
}
