//! Core types for pipeline execution
//!
//! Outcomes of single commands and the lifecycle states of pipelines
//! and stages.

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of one command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Exit code
    pub exit_code: i32,
}

impl CommandResult {
    /// Creates a result from its parts
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns true if command succeeded (exit code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns true if command failed
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Iterates stdout then stderr line by line, skipping blank lines
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
    }
}

impl From<&CommandResult> for bool {
    fn from(result: &CommandResult) -> Self {
        result.is_success()
    }
}

impl From<CommandResult> for bool {
    fn from(result: CommandResult) -> Self {
        result.is_success()
    }
}

/// Lifecycle of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Definition exists, scope not entered yet
    NotStarted,
    /// Scope is open and stages may run
    Active,
    /// Scope closed normally
    Completed,
    /// Scope closed by the early-exit signal
    EarlyExit,
    /// Scope closed by an unhandled fault
    Failed,
}

impl PipelineState {
    /// Returns true once the run has reached a final state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::EarlyExit | Self::Failed)
    }

    /// Returns true unless the run failed
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::EarlyExit)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
            Self::EarlyExit => write!(f, "EarlyExit"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not entered yet
    Pending,
    /// Scope is open
    Running,
    /// Body returned normally
    Succeeded,
    /// Body raised the early-exit signal
    SkippedByExit,
    /// Body returned a fault
    Failed,
}

impl StageState {
    /// Returns true if the stage failed
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCESS"),
            Self::SkippedByExit => write!(f, "SKIPPED"),
            Self::Failed => write!(f, "FAILURE"),
        }
    }
}

/// Trait for types that can be validated
pub trait Validate {
    /// Type of validation error
    type Error;

    /// Validates this type
    fn validate(&self) -> std::result::Result<(), Self::Error>;
}

/// What happened to one stage, kept for the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    /// Stage name
    pub name: String,
    /// Final state
    pub state: StageState,
    /// Wall-clock duration
    pub duration: Duration,
    /// True if the advisory timeout was exceeded
    pub overran: bool,
}
