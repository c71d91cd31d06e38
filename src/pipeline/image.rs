//! Image references

use crate::infrastructure::ContainerRuntime;
use crate::pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Image a pipeline or stage runs in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Image {
    /// Image pulled by name, such as `python:3.11-slim`
    Name(String),
    /// Image built from a build file; the context is the file's directory
    File(PathBuf),
}

impl Image {
    /// Image referenced by name
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Image built from `path`
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Build context for a file image
    #[must_use]
    pub fn build_context(&self) -> Option<&Path> {
        match self {
            Self::Name(_) => None,
            Self::File(path) => Some(
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new(".")),
            ),
        }
    }

    /// Turns the reference into something `create_container` accepts
    ///
    /// File images are built; in dry-run mode they are not, and a marker
    /// reference is returned instead.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Build`] if the build fails.
    pub fn resolve(&self, runtime: &dyn ContainerRuntime, dry_run: bool) -> Result<String, PipelineError> {
        match self {
            Self::Name(name) => Ok(name.clone()),
            Self::File(path) if dry_run => {
                tracing::info!(dockerfile = %path.display(), "Dry run, image not built");
                Ok(format!("dry-run:{}", path.display()))
            }
            Self::File(path) => {
                let context = self.build_context().unwrap_or_else(|| Path::new("."));
                runtime.build_image(context, path)
            }
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl From<&str> for Image {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Image {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    #[test]
    fn test_build_context() {
        assert_eq!(
            Image::file("docker/ci/Dockerfile").build_context(),
            Some(Path::new("docker/ci"))
        );
        assert_eq!(Image::file("Dockerfile").build_context(), Some(Path::new(".")));
        assert_eq!(Image::name("alpine").build_context(), None);
    }

    #[test]
    fn test_resolve_name_does_not_build() {
        let runtime = FakeRuntime::new();
        assert_eq!(Image::name("alpine").resolve(&runtime, false).unwrap(), "alpine");
        assert_eq!(runtime.calls_named("build"), 0);
    }

    #[test]
    fn test_resolve_file_builds() {
        let runtime = FakeRuntime::new();
        let image = Image::file("./Dockerfile").resolve(&runtime, false).unwrap();

        assert!(image.starts_with("sha256:"));
        assert_eq!(runtime.calls_named("build"), 1);
    }

    #[test]
    fn test_resolve_file_dry_run_skips_build() {
        let runtime = FakeRuntime::new();
        let image = Image::file("Dockerfile").resolve(&runtime, true).unwrap();

        assert_eq!(image, "dry-run:Dockerfile");
        assert_eq!(runtime.calls_named("build"), 0);
    }

    #[test]
    fn test_build_failure_surfaces_log() {
        let runtime = FakeRuntime::new().failing_build("step 2/5: RUN false");
        let err = Image::file("Dockerfile").resolve(&runtime, false).unwrap_err();

        assert!(matches!(err, PipelineError::Build { ref log, .. } if log.contains("RUN false")));
    }

    #[test]
    fn test_display() {
        assert_eq!(Image::from("python:3.11-slim").to_string(), "python:3.11-slim");
        assert_eq!(Image::file("Dockerfile").to_string(), "file:Dockerfile");
    }
}
