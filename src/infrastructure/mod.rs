//! Infrastructure layer
//!
//! Adapters for everything outside the process: the container engine, the
//! log collector, secret stores, interactive input, configuration and
//! logging.

mod config;
pub mod container;
mod input;
mod logging;
mod metrics;
pub mod relay;
pub mod runtime;
mod secrets;
pub mod transport;

pub use config::{BRANCH_VARIABLES, Config};
pub use container::{CliRuntime, Engine};
pub use input::{InputKind, InputProvider, InputRequest, InputValue, NoInput, StdinInput, parse_confirm};
pub use logging::{build_filter, init_logging};
pub use metrics::{MetricsCollector, RunMetrics};
pub use relay::{LogFollower, Relay, RetryPolicy};
pub use runtime::{
    ContainerHandle, ContainerOptions, ContainerRegistry, ContainerRuntime, HealthStatus,
    LogStream, MANAGED_LABEL, PortBinding, RUN_LABEL, VolumeMount,
};
pub use secrets::{
    DEFAULT_SECRET_PREFIX, EnvSecretStore, SecretRef, SecretStore, SecretString, StaticSecretStore,
};
pub use transport::{
    EventKind, HttpTransport, MemoryTransport, RelayError, RelayEvent, RelayTransport,
    TracingTransport,
};
