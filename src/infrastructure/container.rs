//! Container runtime backed by the Docker or Podman CLI
//!
//! Every operation shells out to the engine binary. Containers created here
//! carry the `danube.managed` label so `danube cleanup` can find leftovers
//! from crashed runs.

use crate::infrastructure::runtime::{
    ContainerHandle, ContainerOptions, ContainerRegistry, ContainerRuntime, HealthStatus,
    LogStream, MANAGED_LABEL, PortBinding, RUN_LABEL,
};
use crate::pipeline::{CommandResult, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;

/// Idle process that keeps a container alive between execs
const KEEP_ALIVE: [&str; 3] = ["sh", "-c", "tail -f /dev/null"];

/// Container engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Docker engine
    #[default]
    Docker,
    /// Podman engine
    Podman,
}

impl Engine {
    /// Executable name
    #[must_use]
    pub fn program(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    fn version_format(&self) -> &'static str {
        match self {
            Self::Docker => "{{.Server.Version}}",
            Self::Podman => "{{.Client.Version}}",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

impl std::str::FromStr for Engine {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(PipelineError::RuntimeUnavailable(format!(
                "unknown container engine '{other}'"
            ))),
        }
    }
}

/// [`ContainerRuntime`] that drives the engine CLI
#[derive(Debug)]
pub struct CliRuntime {
    engine: Engine,
    program: String,
    run_id: String,
    registry: ContainerRegistry,
}

impl CliRuntime {
    /// Creates a runtime for the given engine
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            program: engine.program().to_string(),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            registry: ContainerRegistry::new(),
        }
    }

    /// Creates a Docker runtime
    #[must_use]
    pub fn docker() -> Self {
        Self::new(Engine::Docker)
    }

    /// Creates a Podman runtime
    #[must_use]
    pub fn podman() -> Self {
        Self::new(Engine::Podman)
    }

    /// Overrides the engine executable path
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Engine in use
    #[must_use]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Identifier stamped on every container of this process
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Runs the engine and returns trimmed stdout, failing on non-zero exit
    fn invoke(&self, operation: &str, args: &[String]) -> Result<String, PipelineError> {
        tracing::trace!(engine = %self.engine, ?args, "Invoking container engine");

        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|e| self.spawn_error(&e))?;

        if !output.status.success() {
            return Err(engine_failure(
                operation,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, err: &std::io::Error) -> PipelineError {
        PipelineError::RuntimeUnavailable(format!("{}: {err}", self.program))
    }

    fn default_name(prefix: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &id[..8])
    }

    fn label_args(&self, args: &mut Vec<String>, extra: &BTreeMap<String, String>) {
        args.push("--label".into());
        args.push(format!("{MANAGED_LABEL}=true"));
        args.push("--label".into());
        args.push(format!("{RUN_LABEL}={}", self.run_id));
        for (key, value) in extra {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
    }

    fn env_args(args: &mut Vec<String>, env: &BTreeMap<String, String>) {
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
    }

    fn port_args(args: &mut Vec<String>, ports: &[PortBinding]) {
        for port in ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }
    }

    /// Arguments for `create`
    pub(crate) fn create_args(&self, name: &str, image: &str, options: &ContainerOptions) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".into(), name.to_string()];
        self.label_args(&mut args, &options.labels);
        Self::env_args(&mut args, &options.env);
        Self::port_args(&mut args, &options.ports);

        for volume in &options.volumes {
            let mut spec = format!("{}:{}", volume.source.display(), volume.target.display());
            if volume.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        }

        if let Some(dir) = &options.working_dir {
            args.push("-w".into());
            args.push(dir.clone());
        }

        args.push(image.to_string());
        match &options.command {
            Some(command) => args.extend(command.iter().cloned()),
            None => args.extend(KEEP_ALIVE.iter().map(|s| (*s).to_string())),
        }
        args
    }

    /// Ids of every container labelled as managed by danube, from any run
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    pub fn list_managed(&self) -> Result<Vec<String>, PipelineError> {
        let out = self.invoke(
            "list",
            &[
                "ps".into(),
                "-aq".into(),
                "--filter".into(),
                format!("label={MANAGED_LABEL}=true"),
            ],
        )?;
        Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Force-removes every managed container, including other runs' leftovers
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    pub fn remove_managed(&self) -> Result<usize, PipelineError> {
        let mut removed = 0;
        for id in self.list_managed()? {
            match self.invoke("remove", &["rm".into(), "-f".into(), id.clone()]) {
                Ok(_) => {
                    tracing::info!(container = %id, "Removed managed container");
                    self.registry.unregister(&id);
                    removed += 1;
                }
                Err(e) => tracing::warn!(container = %id, error = %e, "Failed to remove container"),
            }
        }
        Ok(removed)
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

/// Messages docker and podman print when their daemon or socket is down
const UNREACHABLE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "unable to connect to podman",
    "cannot connect to podman",
];

fn is_unreachable(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    UNREACHABLE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Classifies a failed engine invocation
fn engine_failure(operation: &str, stderr: &str) -> PipelineError {
    if is_unreachable(stderr) {
        PipelineError::RuntimeUnavailable(stderr.to_string())
    } else {
        PipelineError::container(operation, stderr)
    }
}

/// Returns true if the engine says the container does not exist
fn is_gone(err: &PipelineError) -> bool {
    let PipelineError::Container { reason, .. } = err else {
        return false;
    };
    let reason = reason.to_ascii_lowercase();
    reason.contains("no such container") || reason.contains("no container with name or id")
}

impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        self.engine.program()
    }

    fn health_check(&self) -> HealthStatus {
        let installed = self
            .command()
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !installed {
            return HealthStatus::Unhealthy {
                reason: format!("{} is not installed", self.program),
            };
        }

        match self.invoke(
            "version",
            &["version".into(), "--format".into(), self.engine.version_format().into()],
        ) {
            Ok(version) => {
                tracing::info!(engine = %self.engine, version = %version, "Container engine available");
                HealthStatus::Healthy
            }
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("{} daemon unreachable: {e}", self.engine),
            },
        }
    }

    fn build_image(&self, context: &Path, dockerfile: &Path) -> Result<String, PipelineError> {
        tracing::info!(dockerfile = %dockerfile.display(), context = %context.display(), "Building image");

        let output = self
            .command()
            .arg("build")
            .arg("-q")
            .arg("--label")
            .arg(format!("{MANAGED_LABEL}=true"))
            .arg("-f")
            .arg(dockerfile)
            .arg(context)
            .output()
            .map_err(|e| self.spawn_error(&e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_unreachable(&stderr) {
                return Err(PipelineError::RuntimeUnavailable(stderr.trim().to_string()));
            }
            return Err(PipelineError::Build {
                dockerfile: dockerfile.display().to_string(),
                log: format!("{}{}", stdout, stderr).trim().to_string(),
            });
        }

        let image_id = stdout.lines().last().unwrap_or_default().trim().to_string();
        tracing::info!(image = %image_id, "Image built");
        Ok(image_id)
    }

    fn create_container(
        &self,
        image: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerHandle, PipelineError> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| Self::default_name("danube"));
        let id = self.invoke("create", &self.create_args(&name, image, options))?;

        let handle = ContainerHandle::new(id, name, image);
        self.registry.register(&handle);
        tracing::debug!(container = %handle, image = %image, "Container created");
        Ok(handle)
    }

    fn start(&self, handle: &ContainerHandle) -> Result<(), PipelineError> {
        self.invoke("start", &["start".into(), handle.id.clone()])?;
        tracing::debug!(container = %handle, "Container started");
        Ok(())
    }

    fn run_detached(
        &self,
        image: &str,
        env: &BTreeMap<String, String>,
        ports: &[PortBinding],
    ) -> Result<ContainerHandle, PipelineError> {
        let name = Self::default_name("danube-main");
        let mut args = vec!["run".to_string(), "-d".into(), "--name".into(), name.clone()];
        self.label_args(&mut args, &BTreeMap::new());
        Self::env_args(&mut args, env);
        Self::port_args(&mut args, ports);
        args.push(image.to_string());
        args.extend(KEEP_ALIVE.iter().map(|s| (*s).to_string()));

        let id = self.invoke("run", &args)?;

        let handle = ContainerHandle::new(id, name, image);
        self.registry.register(&handle);
        tracing::info!(container = %handle, image = %image, "Main container running");
        Ok(handle)
    }

    fn exec(&self, handle: &ContainerHandle, command: &str) -> Result<CommandResult, PipelineError> {
        let output = self
            .command()
            .arg("exec")
            .arg(&handle.id)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| self.spawn_error(&e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && output.stdout.is_empty() && is_unreachable(&stderr) {
            return Err(PipelineError::RuntimeUnavailable(stderr.trim().to_string()));
        }

        Ok(CommandResult::new(
            String::from_utf8_lossy(&output.stdout),
            stderr,
            output.status.code().unwrap_or(-1),
        ))
    }

    fn stop(&self, handle: &ContainerHandle) -> Result<(), PipelineError> {
        if !self.registry.contains(&handle.id) {
            tracing::debug!(container = %handle, "Stop skipped, container already removed");
            return Ok(());
        }

        match self.invoke("stop", &["stop".into(), "-t".into(), "1".into(), handle.id.clone()]) {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => {
                tracing::debug!(container = %handle, "Stop skipped, container already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<(), PipelineError> {
        if !self.registry.contains(&handle.id) {
            tracing::debug!(container = %handle, "Remove skipped, container already removed");
            return Ok(());
        }

        match self.invoke("remove", &["rm".into(), "-f".into(), handle.id.clone()]) {
            Ok(_) => {}
            Err(e) if is_gone(&e) => {
                tracing::debug!(container = %handle, "Container already gone");
            }
            Err(e) => return Err(e),
        }

        self.registry.unregister(&handle.id);
        tracing::debug!(container = %handle, "Container removed");
        Ok(())
    }

    fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStream, PipelineError> {
        let since = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let mut child = self
            .command()
            .arg("logs")
            .arg("-f")
            .arg("--since")
            .arg(since)
            .arg(&handle.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(&e))?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        Ok(LogStream::new(FollowedLogs { child, lines: rx }))
    }

    fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }
}

fn forward_lines(pipe: impl Read + Send + 'static, tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Lines from a `logs -f` child; dropping it kills the child
struct FollowedLogs {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl Iterator for FollowedLogs {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.lines.recv().ok()
    }
}

impl Drop for FollowedLogs {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
