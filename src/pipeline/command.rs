//! Commands a stage can run
//!
//! A command is either a shell string, executed in a container, or an
//! in-process callable.

use super::types::CommandResult;
use std::fmt;

type Callable<'a> = Box<dyn FnOnce() -> CommandResult + Send + 'a>;

/// Unit of work passed to `Stage::run`
pub enum Command<'a> {
    /// Shell command run with `sh -c` inside a container
    Shell(String),
    /// Function invoked in-process
    Call {
        /// Name used in logs
        name: String,
        /// The function
        func: Callable<'a>,
    },
}

impl<'a> Command<'a> {
    /// Shell command
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell(command.into())
    }

    /// Callable whose return value becomes stdout
    pub fn call<T, F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> T + Send + 'a,
        T: fmt::Display,
    {
        Self::Call {
            name: name.into(),
            func: Box::new(move || CommandResult::new(func().to_string(), "", 0)),
        }
    }

    /// Fallible callable; an error becomes exit code 1 with the error as stderr
    pub fn try_call<T, E, F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'a,
        T: fmt::Display,
        E: fmt::Display,
    {
        Self::Call {
            name: name.into(),
            func: Box::new(move || match func() {
                Ok(value) => CommandResult::new(value.to_string(), "", 0),
                Err(e) => CommandResult::new("", e.to_string(), 1),
            }),
        }
    }

    /// Short description for logs
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Shell(command) => command.clone(),
            Self::Call { name, .. } => format!("call {name}"),
        }
    }

    /// Returns true for in-process callables
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(command) => f.debug_tuple("Shell").field(command).finish(),
            Self::Call { name, .. } => f.debug_struct("Call").field("name", name).finish_non_exhaustive(),
        }
    }
}

impl From<&str> for Command<'_> {
    fn from(command: &str) -> Self {
        Self::Shell(command.to_string())
    }
}

impl From<String> for Command<'_> {
    fn from(command: String) -> Self {
        Self::Shell(command)
    }
}

impl From<&String> for Command<'_> {
    fn from(command: &String) -> Self {
        Self::Shell(command.clone())
    }
}
