//! Secret stores
//!
//! Secret values are wrapped in [`SecretString`] so they cannot end up in a
//! log line through `Debug` or `Display` by accident.

use crate::pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default prefix for [`EnvSecretStore`]
pub const DEFAULT_SECRET_PREFIX: &str = "DANUBE_SECRET_";

/// A resolved secret value
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plain value
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length of the value in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the value is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Declared secret: a name used in pipeline code and the key in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name used by pipeline code
    pub name: String,
    /// Key looked up in the store
    pub key: String,
    /// What the secret is for
    #[serde(default)]
    pub description: String,
}

impl SecretRef {
    /// Declares a secret whose store key differs from its name
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            description: String::new(),
        }
    }

    /// Sets the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// External store secrets are fetched from
#[allow(clippy::missing_errors_doc)]
pub trait SecretStore: Send + Sync {
    /// Store name, for logs
    fn name(&self) -> &str;

    /// Fetches the value stored under `key`
    fn fetch(&self, key: &str) -> Result<SecretString, PipelineError>;
}

/// Reads secrets from `<prefix><KEY>` environment variables
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    /// Creates a store reading variables with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for `key`
    #[must_use]
    pub fn variable(&self, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{key}", self.prefix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_PREFIX)
    }
}

impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "env"
    }

    fn fetch(&self, key: &str) -> Result<SecretString, PipelineError> {
        let variable = self.variable(key);
        std::env::var(&variable)
            .map(SecretString::new)
            .map_err(|e| PipelineError::Secret {
                name: key.to_string(),
                reason: format!("{variable}: {e}"),
            })
    }
}

/// Fixed in-memory secrets
#[derive(Debug, Default)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
    lookups: AtomicUsize,
}

impl StaticSecretStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Number of fetches made against this store
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SecretStore for StaticSecretStore {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch(&self, key: &str) -> Result<SecretString, PipelineError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.values
            .get(key)
            .map(SecretString::new)
            .ok_or_else(|| PipelineError::Secret {
                name: key.to_string(),
                reason: "not found".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_never_formats_value() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{secret}"), "***");
        assert_eq!(format!("{secret:?}"), "SecretString(***)");
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(secret.len(), 7);
    }

    #[test]
    fn test_env_store_variable_name() {
        let store = EnvSecretStore::default();
        assert_eq!(store.variable("pypi-token"), "DANUBE_SECRET_PYPI_TOKEN");
        assert_eq!(EnvSecretStore::new("X_").variable("a.b"), "X_A_B");
    }

    #[test]
    fn test_env_store_missing_variable() {
        let store = EnvSecretStore::new("DANUBE_TEST_SECRET_UNSET_");
        let err = store.fetch("nothing").unwrap_err();
        assert!(matches!(err, PipelineError::Secret { ref name, .. } if name == "nothing"));
    }

    #[test]
    fn test_static_store_counts_lookups() {
        let store = StaticSecretStore::new().with("pypi", "s3cret");

        assert_eq!(store.fetch("pypi").unwrap().expose(), "s3cret");
        assert!(store.fetch("missing").is_err());
        assert_eq!(store.lookups(), 2);
    }
}
