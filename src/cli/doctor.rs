//! `danube doctor` - Check the container engine and the log collector

use crate::infrastructure::{
    CliRuntime, Config, ContainerRuntime, HealthStatus, HttpTransport, RelayTransport,
};
use anyhow::{Context, Result};

/// Health of everything a run depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    /// Container engine
    pub runtime: HealthStatus,
    /// Log collector; `None` when no collector is configured
    pub relay: Option<HealthStatus>,
}

impl Diagnosis {
    /// Returns true if a pipeline can run
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.runtime.is_operational()
            && self.relay.as_ref().is_none_or(HealthStatus::is_operational)
    }
}

/// Checks the engine and collector named in `config`
///
/// # Errors
///
/// Returns an error if the relay URL is invalid.
pub fn diagnose(config: &Config) -> Result<Diagnosis> {
    let runtime = CliRuntime::new(config.engine);
    diagnose_with(&runtime, config)
}

/// Checks `runtime` and the collector named in `config`
///
/// # Errors
///
/// Returns an error if the relay URL is invalid.
pub fn diagnose_with(runtime: &dyn ContainerRuntime, config: &Config) -> Result<Diagnosis> {
    let relay = match &config.relay_url {
        Some(url) => {
            let transport = HttpTransport::new(url)
                .with_context(|| format!("Invalid relay URL: {url}"))?;
            Some(transport.health_check())
        }
        None => None,
    };

    Ok(Diagnosis {
        runtime: runtime.health_check(),
        relay,
    })
}

/// Printable form of a diagnosis
#[must_use]
pub fn format_diagnosis(runtime_name: &str, diagnosis: &Diagnosis) -> String {
    let relay = match &diagnosis.relay {
        Some(status) => status.to_string(),
        None => "not configured, logging locally".to_string(),
    };
    format!("container engine ({runtime_name}): {}\nlog collector: {relay}", diagnosis.runtime)
}
