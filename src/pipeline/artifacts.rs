//! Artifact registry
//!
//! Saving an artifact only records the intent. Patterns are resolved against
//! the filesystem when the pipeline closes.

use super::errors::PipelineError;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// An artifact saved by pipeline code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Artifact name
    pub name: String,
    /// Path or glob pattern
    pub pattern: String,
    /// Keep only this many newest files; all when `None`
    pub retention: Option<usize>,
}

impl Artifact {
    /// Creates an artifact keeping every matching file
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            retention: None,
        }
    }

    /// Keeps only the `count` newest files
    #[must_use]
    pub fn with_retention(mut self, count: usize) -> Self {
        self.retention = Some(count);
        self
    }
}

/// Files an artifact pattern resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactResolution {
    /// Artifact name
    pub name: String,
    /// Pattern as saved
    pub pattern: String,
    /// Matching files, sorted
    pub files: Vec<PathBuf>,
}

impl ArtifactResolution {
    /// Returns true if nothing matched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Pipeline-wide list of saved artifacts
#[derive(Debug)]
pub struct ArtifactRegistry {
    base_dir: PathBuf,
    saved: Mutex<Vec<Artifact>>,
}

impl ArtifactRegistry {
    /// Creates a registry resolving relative patterns against `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            saved: Mutex::new(Vec::new()),
        }
    }

    /// Directory relative patterns are resolved against
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Records an artifact
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Artifact`] if the pattern is not a valid glob.
    pub fn save(&self, artifact: Artifact) -> Result<(), PipelineError> {
        glob::Pattern::new(&artifact.pattern).map_err(|e| PipelineError::Artifact {
            pattern: artifact.pattern.clone(),
            reason: e.to_string(),
        })?;

        tracing::debug!(artifact = %artifact.name, pattern = %artifact.pattern, "Artifact saved");
        self.saved.lock().push(artifact);
        Ok(())
    }

    /// Saved artifacts, in order
    #[must_use]
    pub fn saved(&self) -> Vec<Artifact> {
        self.saved.lock().clone()
    }

    /// Number of saved artifacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.saved.lock().len()
    }

    /// Returns true if nothing was saved
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.saved.lock().is_empty()
    }

    /// Resolves every saved pattern
    ///
    /// Empty resolutions are kept and logged as warnings.
    #[must_use]
    pub fn resolve_all(&self) -> Vec<ArtifactResolution> {
        self.saved()
            .iter()
            .map(|artifact| self.resolve(artifact))
            .collect()
    }

    fn resolve(&self, artifact: &Artifact) -> ArtifactResolution {
        let full = self.base_dir.join(&artifact.pattern);
        let mut files: Vec<PathBuf> = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
            Err(e) => {
                tracing::warn!(pattern = %artifact.pattern, error = %e, "Invalid artifact pattern");
                Vec::new()
            }
        };

        if let Some(keep) = artifact.retention {
            files.sort_by_key(|p| {
                std::cmp::Reverse(
                    p.metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH),
                )
            });
            files.truncate(keep);
        }
        files.sort();

        if files.is_empty() {
            tracing::warn!(
                artifact = %artifact.name,
                pattern = %artifact.pattern,
                "No files found for artifact pattern {}",
                artifact.pattern
            );
        } else {
            tracing::info!(artifact = %artifact.name, count = files.len(), "Artifact resolved");
        }

        ArtifactResolution {
            name: artifact.name.clone(),
            pattern: artifact.pattern.clone(),
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn test_resolve_glob() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("dist")).unwrap();
        fs::write(dir.path().join("dist/a-1.0.whl"), b"").unwrap();
        fs::write(dir.path().join("dist/a-1.0.tar.gz"), b"").unwrap();

        let registry = ArtifactRegistry::new(dir.path());
        registry.save(Artifact::new("dist-package", "dist/*.whl")).unwrap();

        let resolved = registry.resolve_all();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].files, vec![dir.path().join("dist/a-1.0.whl")]);
    }

    #[test]
    fn test_empty_resolution_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path());
        registry.save(Artifact::new("report", "htmlcov/*.html")).unwrap();

        let resolved = registry.resolve_all();
        assert!(resolved[0].is_empty());
        assert_eq!(resolved[0].pattern, "htmlcov/*.html");
    }

    #[test]
    fn test_invalid_pattern_rejected_on_save() {
        let registry = ArtifactRegistry::new(".");
        let err = registry.save(Artifact::new("bad", "dist/[")).unwrap_err();

        assert!(matches!(err, PipelineError::Artifact { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retention_keeps_count() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.log", "b.log", "c.log"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let registry = ArtifactRegistry::new(dir.path());
        registry
            .save(Artifact::new("logs", "*.log").with_retention(2))
            .unwrap();

        assert_eq!(registry.resolve_all()[0].files.len(), 2);
    }

    #[test]
    fn test_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("out")).unwrap();

        let registry = ArtifactRegistry::new(dir.path());
        registry.save(Artifact::new("out", "*")).unwrap();

        assert!(registry.resolve_all()[0].is_empty());
    }
}
