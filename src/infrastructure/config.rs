//! Configuration management
//!
//! Settings come from an optional YAML file, then `DANUBE_*` environment
//! variables override individual fields.

use crate::infrastructure::container::Engine;
use crate::infrastructure::relay::RetryPolicy;
use crate::infrastructure::secrets::DEFAULT_SECRET_PREFIX;
use crate::pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables consulted for the branch, in order
pub const BRANCH_VARIABLES: [&str; 4] = [
    "DANUBE_BRANCH",
    "GITHUB_REF_NAME",
    "CI_COMMIT_BRANCH",
    "BRANCH_NAME",
];

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Container engine
    pub engine: Engine,
    /// Log collector base URL; local logging when unset
    pub relay_url: Option<String>,
    /// Branch used when none is found in the environment
    pub default_branch: String,
    /// Worker threads for parallel sub-steps
    pub workers: usize,
    /// Run without container, secret or input side effects
    pub dry_run: bool,
    /// Log level
    pub log_level: String,
    /// Relay retry behavior
    pub retry: RetryPolicy,
    /// Start a long-lived main container for the pipeline image
    pub main_container: bool,
    /// Host directory mounted at `/workspace` in stage containers
    pub workdir_mount: Option<PathBuf>,
    /// Prefix of environment variables holding secrets
    pub secret_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: Engine::Docker,
            relay_url: None,
            default_branch: "main".to_string(),
            workers: 4,
            dry_run: false,
            log_level: "info".to_string(),
            retry: RetryPolicy::default(),
            main_container: false,
            workdir_mount: None,
            secret_prefix: DEFAULT_SECRET_PREFIX.to_string(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Reads a YAML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
            .map_err(|e| PipelineError::other(format!("{}: {e}", path.display())))
    }

    /// Parses YAML configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::other(format!("invalid configuration: {e}")))
    }

    /// Defaults with the process environment applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Applies `DANUBE_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Applies `DANUBE_*` overrides read through `lookup`
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("DANUBE_ENGINE") {
            match value.parse() {
                Ok(engine) => self.engine = engine,
                Err(e) => tracing::warn!(error = %e, "Ignoring DANUBE_ENGINE"),
            }
        }
        if let Some(value) = lookup("DANUBE_SERVER_URL") {
            self.relay_url = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("DANUBE_DEFAULT_BRANCH") {
            self.default_branch = value;
        }
        if let Some(value) = lookup("DANUBE_WORKERS") {
            match value.trim().parse::<usize>() {
                Ok(workers) if workers > 0 => self.workers = workers,
                _ => tracing::warn!(value = %value, "Ignoring DANUBE_WORKERS"),
            }
        }
        if let Some(value) = lookup("DANUBE_DRY_RUN") {
            match parse_flag(&value) {
                Some(flag) => self.dry_run = flag,
                None => tracing::warn!(value = %value, "Ignoring DANUBE_DRY_RUN"),
            }
        }
        if let Some(value) = lookup("DANUBE_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("DANUBE_MAIN_CONTAINER") {
            match parse_flag(&value) {
                Some(flag) => self.main_container = flag,
                None => tracing::warn!(value = %value, "Ignoring DANUBE_MAIN_CONTAINER"),
            }
        }
    }

    /// Active branch from the process environment
    #[must_use]
    pub fn detect_branch(&self) -> String {
        self.detect_branch_with(|key| std::env::var(key).ok())
    }

    /// Active branch read through `lookup`, falling back to `default_branch`
    #[must_use]
    pub fn detect_branch_with(&self, lookup: impl Fn(&str) -> Option<String>) -> String {
        BRANCH_VARIABLES
            .iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_branch.clone())
    }
}
