//! Error types for the pipeline engine
//!
//! Faults are [`PipelineError`]. The early-exit signal is deliberately not one
//! of them: it travels as [`Flow::Stop`] so that each stage and pipeline
//! boundary can tell "stop further stages" apart from a real failure.

use thiserror::Error;

/// Errors that can occur while running a pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Image build exited non-zero; carries the build log
    #[error("Image build failed for '{dockerfile}': {log}")]
    Build {
        /// Build file that was being built.
        dockerfile: String,
        /// Output captured from the build.
        log: String,
    },

    /// The container engine could not be reached
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A container engine operation failed
    #[error("Container operation '{operation}' failed: {reason}")]
    Container {
        /// Engine operation (create, start, exec, ...).
        operation: String,
        /// Error reported by the engine.
        reason: String,
    },

    /// No answer arrived before the input deadline
    #[error("Input '{name}' timed out after {seconds}s")]
    InputTimeout {
        /// Name of the input request.
        name: String,
        /// Timeout that elapsed, in seconds.
        seconds: u64,
    },

    /// Secret lookup failed
    #[error("Secret '{name}' could not be resolved: {reason}")]
    Secret {
        /// Secret name.
        name: String,
        /// Why it failed.
        reason: String,
    },

    /// Build parameter definition or override is invalid
    #[error("Invalid build parameter '{name}': {reason}")]
    Parameter {
        /// Parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Artifact pattern could not be interpreted
    #[error("Invalid artifact pattern '{pattern}': {reason}")]
    Artifact {
        /// The glob pattern.
        pattern: String,
        /// Parser error.
        reason: String,
    },

    /// Relay could not be contacted
    #[error("Relay error: {0}")]
    Relay(String),

    /// Another pipeline is already active on this runner
    #[error("A pipeline is already active on this runner")]
    AlreadyActive,

    /// Invalid trigger or definition
    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(String),

    /// Any other fault raised by pipeline code
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Creates an unclassified fault from any message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Creates a container operation error
    pub fn container(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Container {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Fault for a panic payload caught at a stage or pipeline boundary
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Other(format!("panicked: {message}"))
    }

    /// Returns true for faults that make further stages pointless
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Build { .. } | Self::RuntimeUnavailable(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Control-flow outcome of pipeline author code
///
/// `Stop` is the cooperative early-exit signal, absorbed at stage and
/// pipeline boundaries. `Fault` carries a real failure to the pipeline
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Stop further stages without failing the run
    Stop {
        /// Human readable reason, reported to the relay.
        reason: String,
    },
    /// A fault that fails the run
    Fault(PipelineError),
}

impl Flow {
    /// Creates the early-exit signal
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop {
            reason: reason.into(),
        }
    }

    /// Creates an unclassified fault
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fault(PipelineError::other(message))
    }

    /// Returns true if this is the early-exit signal
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop { reason } => write!(f, "stopped: {reason}"),
            Self::Fault(err) => write!(f, "{err}"),
        }
    }
}

impl From<PipelineError> for Flow {
    fn from(err: PipelineError) -> Self {
        Self::Fault(err)
    }
}

impl From<std::io::Error> for Flow {
    fn from(err: std::io::Error) -> Self {
        Self::Fault(err.into())
    }
}

/// Result type for pipeline and stage bodies
pub type StepResult<T = ()> = std::result::Result<T, Flow>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_from_pipeline_error_is_fault() {
        let flow: Flow = PipelineError::other("boom").into();
        assert!(!flow.is_stop());
        assert_eq!(flow.to_string(), "boom");
    }

    #[test]
    fn test_flow_stop_display() {
        let flow = Flow::stop("tests failed");
        assert!(flow.is_stop());
        assert_eq!(flow.to_string(), "stopped: tests failed");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(PipelineError::RuntimeUnavailable("no socket".into()).is_fatal());
        assert!(
            PipelineError::Build {
                dockerfile: "Dockerfile".into(),
                log: "step 3 failed".into()
            }
            .is_fatal()
        );
        assert!(!PipelineError::other("x").is_fatal());
    }

    #[test]
    fn test_from_panic_payloads() {
        let literal = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(
            PipelineError::from_panic(literal.as_ref()),
            PipelineError::Other("panicked: boom".into())
        );

        let formatted = std::panic::catch_unwind(|| panic!("exit {}", 3)).unwrap_err();
        assert_eq!(PipelineError::from_panic(formatted.as_ref()).to_string(), "panicked: exit 3");

        let opaque = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert!(PipelineError::from_panic(opaque.as_ref()).to_string().contains("non-string"));
    }

    #[test]
    fn test_question_mark_converts_pipeline_error() {
        fn body() -> StepResult<u8> {
            Err(PipelineError::AlreadyActive)?;
            Ok(1)
        }
        assert_eq!(body(), Err(Flow::Fault(PipelineError::AlreadyActive)));
    }
}
