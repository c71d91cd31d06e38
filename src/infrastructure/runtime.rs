//! Container runtime trait and shared types.
//!
//! The pipeline engine talks to a container engine only through
//! [`ContainerRuntime`]. Every handle a runtime creates is recorded in its
//! [`ContainerRegistry`] so that [`ContainerRuntime::remove_all`] can reclaim
//! anything a crashed or failed stage left behind.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::pipeline::{CommandResult, PipelineError};

/// Label put on every container danube creates
pub const MANAGED_LABEL: &str = "danube.managed";

/// Label carrying the run identifier
pub const RUN_LABEL: &str = "danube.run";

/// Handle to one container created by a runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContainerHandle {
    /// Engine-assigned identifier
    pub id: String,
    /// Container name
    pub name: String,
    /// Image the container was created from
    pub image: String,
}

impl ContainerHandle {
    /// Creates a handle
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
        }
    }

    /// First twelve characters of the id, as engines print it
    #[must_use]
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.short_id())
    }
}

/// Port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port on the host
    pub host_port: u16,
    /// Port inside the container
    pub container_port: u16,
}

impl PortBinding {
    /// Maps `host_port` to `container_port`
    #[must_use]
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path
    pub source: PathBuf,
    /// Path inside the container
    pub target: PathBuf,
    /// Mount read-only
    pub read_only: bool,
}

/// Options for creating a container
///
/// Passed through to the engine unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Container name; the runtime picks one when `None`
    pub name: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Port bindings
    pub ports: Vec<PortBinding>,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Command to keep the container alive; defaults to an idle shell
    pub command: Option<Vec<String>>,
}

impl ContainerOptions {
    /// Creates empty options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the container name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a volume mount
    #[must_use]
    pub fn with_volume(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.volumes.push(VolumeMount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Health status of a runtime or relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Fully operational
    Healthy,

    /// Some features unavailable
    Degraded {
        /// Reason for degradation
        reason: String,
    },

    /// Not usable
    Unhealthy {
        /// Reason for being unhealthy
        reason: String,
    },
}

impl HealthStatus {
    /// Returns true if healthy or degraded
    #[must_use]
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::Unhealthy { .. })
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded { reason } => write!(f, "degraded ({reason})"),
            Self::Unhealthy { reason } => write!(f, "unhealthy ({reason})"),
        }
    }
}

/// Lazy, cancellable sequence of log lines
///
/// Dropping the stream cancels it.
pub struct LogStream {
    lines: Box<dyn Iterator<Item = String> + Send>,
}

impl LogStream {
    /// Wraps any line iterator
    pub fn new(lines: impl Iterator<Item = String> + Send + 'static) -> Self {
        Self {
            lines: Box::new(lines),
        }
    }

    /// A stream with no lines
    #[must_use]
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }
}

impl Iterator for LogStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.lines.next()
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream").finish_non_exhaustive()
    }
}

/// Set of containers that are still live
///
/// Mutated from several worker threads at once, so every access goes
/// through the lock.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    live: Mutex<Vec<ContainerHandle>>,
}

impl ContainerRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly created container
    pub fn register(&self, handle: &ContainerHandle) {
        let mut live = self.live.lock();
        if !live.iter().any(|h| h.id == handle.id) {
            live.push(handle.clone());
        }
    }

    /// Forgets a container; returns false if it was not registered
    pub fn unregister(&self, id: &str) -> bool {
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|h| h.id != id);
        live.len() != before
    }

    /// Returns true if the container is still live
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.live.lock().iter().any(|h| h.id == id)
    }

    /// Copy of the live handles, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<ContainerHandle> {
        self.live.lock().clone()
    }

    /// Number of live containers
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns true if nothing is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

/// Minimal capability interface over a container engine
///
/// `stop` and `remove` are idempotent: acting on a container that is already
/// stopped or gone is a no-op. `exec` reports non-zero exit codes through
/// [`CommandResult`], never as an error.
#[allow(clippy::missing_errors_doc)]
pub trait ContainerRuntime: Send + Sync {
    /// Engine name, for logs
    fn name(&self) -> &str;

    /// Checks that the engine is reachable
    fn health_check(&self) -> HealthStatus;

    /// Builds an image and returns its id
    fn build_image(&self, context: &Path, dockerfile: &Path) -> Result<String, PipelineError>;

    /// Allocates a container without starting it and registers it as live
    fn create_container(
        &self,
        image: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerHandle, PipelineError>;

    /// Starts a created container
    fn start(&self, handle: &ContainerHandle) -> Result<(), PipelineError>;

    /// Creates and starts a long-lived container
    fn run_detached(
        &self,
        image: &str,
        env: &BTreeMap<String, String>,
        ports: &[PortBinding],
    ) -> Result<ContainerHandle, PipelineError>;

    /// Runs a shell command inside a running container
    fn exec(&self, handle: &ContainerHandle, command: &str)
    -> Result<CommandResult, PipelineError>;

    /// Stops a container
    fn stop(&self, handle: &ContainerHandle) -> Result<(), PipelineError>;

    /// Removes a container and unregisters it
    fn remove(&self, handle: &ContainerHandle) -> Result<(), PipelineError>;

    /// Follows the container's log output from now on
    fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStream, PipelineError>;

    /// Live-container registry of this runtime
    fn registry(&self) -> &ContainerRegistry;

    /// Force-removes every container still marked live
    ///
    /// Errors are logged and swallowed; returns how many removals succeeded.
    fn remove_all(&self) -> usize {
        let live = self.registry().snapshot();
        if live.is_empty() {
            return 0;
        }

        tracing::info!(runtime = %self.name(), count = live.len(), "Removing leftover containers");

        let mut removed = 0;
        for handle in &live {
            match self.remove(handle) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(container = %handle, error = %e, "Failed to remove container");
                }
            }
        }
        removed
    }
}
