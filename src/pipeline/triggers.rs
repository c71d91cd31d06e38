//! Branch and event triggers

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use super::errors::PipelineError;
use super::types::Validate;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which branches and events a pipeline runs for
///
/// Branch entries are regular expressions matched as written, so `^main$`
/// must be anchored by the author. An empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Triggers {
    /// Branch patterns
    pub branches: Vec<String>,
    /// Event names, such as `push` or `pull_request`
    pub events: Vec<String>,
}

impl Triggers {
    /// Triggers that match everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a branch pattern
    pub fn branch(mut self, pattern: impl Into<String>) -> Self {
        self.branches.push(pattern.into());
        self
    }

    /// Adds an event name
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    /// Returns true if `branch` matches one of the patterns
    ///
    /// Invalid patterns never match; [`Validate::validate`] reports them.
    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branches.is_empty()
            || self
                .branches
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .any(|re| re.is_match(branch))
    }

    /// Returns true if `event` is listed
    pub fn matches_event(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event)
    }
}

impl Validate for Triggers {
    type Error = PipelineError;

    fn validate(&self) -> Result<(), Self::Error> {
        for pattern in &self.branches {
            Regex::new(pattern).map_err(|e| {
                PipelineError::Definition(format!("invalid branch pattern '{pattern}': {e}"))
            })?;
        }
        if self.events.iter().any(|e| e.trim().is_empty()) {
            return Err(PipelineError::Definition("empty trigger event".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers() -> Triggers {
        Triggers::new()
            .branch("^main$")
            .branch("^dev$")
            .branch("^feat:.*$")
            .event("push")
            .event("pull_request")
    }

    #[test]
    fn test_matches_branch() {
        let triggers = triggers();
        assert!(triggers.matches_branch("main"));
        assert!(triggers.matches_branch("feat:login"));
        assert!(!triggers.matches_branch("mainline"));
        assert!(!triggers.matches_branch("release"));
    }

    #[test]
    fn test_empty_matches_all() {
        let triggers = Triggers::new();
        assert!(triggers.matches_branch("anything"));
        assert!(triggers.matches_event("tag"));
    }

    #[test]
    fn test_matches_event() {
        let triggers = triggers();
        assert!(triggers.matches_event("push"));
        assert!(!triggers.matches_event("schedule"));
    }

    #[test]
    fn test_unanchored_pattern_matches_substring() {
        assert!(Triggers::new().branch("main").matches_branch("not-main-branch"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        assert!(triggers().validate().is_ok());

        let bad = Triggers::new().branch("feat/(");
        assert!(matches!(bad.validate(), Err(PipelineError::Definition(_))));
        assert!(!bad.matches_branch("feat/("));
    }
}
