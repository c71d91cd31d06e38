//! Pipeline definition and builder

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use crate::infrastructure::{PortBinding, SecretRef};
use crate::pipeline::errors::PipelineError;
use crate::pipeline::image::Image;
use crate::pipeline::params::{BuildParam, BuildParams};
use crate::pipeline::triggers::Triggers;
use crate::pipeline::types::Validate;
use std::collections::BTreeMap;
use std::fmt;

/// Declarative part of a pipeline: everything known before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDef {
    /// Pipeline name, for logs and the collector
    pub name: String,

    /// Default image for stages
    pub image: Image,

    /// Dry-run override; the configuration decides when `None`
    pub dry_run: Option<bool>,

    /// Build parameters
    pub params: BuildParams,

    /// Declared secrets
    pub secrets: Vec<SecretRef>,

    /// Branch and event triggers
    pub triggers: Triggers,

    /// Environment passed to every container
    pub env: BTreeMap<String, String>,

    /// Port bindings for the main container
    pub ports: Vec<PortBinding>,
}

impl PipelineDef {
    /// Creates a definition running in `image`
    pub fn new(image: impl Into<Image>) -> Self {
        Self {
            name: "pipeline".to_string(),
            image: image.into(),
            dry_run: None,
            params: BuildParams::new(),
            secrets: Vec::new(),
            triggers: Triggers::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
        }
    }

    /// Sets the pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Forces dry-run on or off
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    /// Declares a build parameter
    pub fn param(mut self, param: BuildParam) -> Self {
        self.params = self.params.with(param);
        self
    }

    /// Declares a secret
    pub fn secret(mut self, secret: SecretRef) -> Self {
        self.secrets.push(secret);
        self
    }

    /// Sets the triggers
    pub fn triggers(mut self, triggers: Triggers) -> Self {
        self.triggers = triggers;
        self
    }

    /// Adds an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publishes a main-container port
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortBinding::new(host_port, container_port));
        self
    }

    /// Applies `NAME=value` parameter overrides
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parameter`] for unknown or invalid values.
    pub fn with_overrides<S: AsRef<str>>(mut self, overrides: &[S]) -> Result<Self, PipelineError> {
        self.params.apply_overrides(overrides)?;
        Ok(self)
    }

    /// Store key for a secret name; undeclared names map to themselves
    pub fn secret_key<'a>(&'a self, name: &'a str) -> &'a str {
        self.secrets
            .iter()
            .find(|s| s.name == name)
            .map_or(name, |s| s.key.as_str())
    }
}

impl Validate for PipelineDef {
    type Error = PipelineError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Definition("pipeline name is empty".into()));
        }
        match &self.image {
            Image::Name(name) if name.trim().is_empty() => {
                return Err(PipelineError::Definition("image name is empty".into()));
            }
            Image::File(path) if path.as_os_str().is_empty() => {
                return Err(PipelineError::Definition("image file path is empty".into()));
            }
            _ => {}
        }
        for (i, secret) in self.secrets.iter().enumerate() {
            if self.secrets[..i].iter().any(|s| s.name == secret.name) {
                return Err(PipelineError::Definition(format!(
                    "secret '{}' declared twice",
                    secret.name
                )));
            }
        }
        self.params.validate()?;
        self.triggers.validate()
    }
}

impl fmt::Display for PipelineDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({}): image {}", self.name, self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let def = PipelineDef::new("python:3.11-slim")
            .name("danube")
            .param(BuildParam::bool("DEPLOY", "Deploy after build", true))
            .secret(SecretRef::new("API_KEY", "deploy/api-key"))
            .env("CI", "true")
            .port(8000, 8000);

        assert_eq!(def.name, "danube");
        assert_eq!(def.image, Image::name("python:3.11-slim"));
        assert_eq!(def.ports, vec![PortBinding::new(8000, 8000)]);
        assert!(def.validate().is_ok());
        assert_eq!(def.to_string(), "Pipeline(danube): image python:3.11-slim");
    }

    #[test]
    fn test_secret_key_lookup() {
        let def = PipelineDef::new("alpine").secret(SecretRef::new("API_KEY", "deploy/api-key"));
        assert_eq!(def.secret_key("API_KEY"), "deploy/api-key");
        assert_eq!(def.secret_key("OTHER"), "OTHER");
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_triggers() {
        let dup = PipelineDef::new("alpine")
            .secret(SecretRef::new("A", "a"))
            .secret(SecretRef::new("A", "b"));
        assert!(dup.validate().is_err());

        let bad = PipelineDef::new("alpine").triggers(Triggers::new().branch("("));
        assert!(bad.validate().is_err());

        assert!(PipelineDef::new("").validate().is_err());
    }

    #[test]
    fn test_with_overrides() {
        let def = PipelineDef::new("alpine")
            .param(BuildParam::bool("DEPLOY", "", true))
            .with_overrides(&["DEPLOY=no"])
            .unwrap();
        assert!(!def.params.bool("DEPLOY").unwrap());

        let err = PipelineDef::new("alpine").with_overrides(&["DEPLOY=no"]);
        assert!(err.is_err());
    }
}
