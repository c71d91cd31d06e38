//! Metrics collection
//!
//! Counters for one pipeline run, updated from any worker thread.

use crate::pipeline::StageState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Metrics for a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    /// Run duration
    pub duration: Duration,

    /// Number of stages entered
    pub stage_count: usize,

    /// Stages that succeeded
    pub successful_stages: usize,

    /// Stages that failed
    pub failed_stages: usize,

    /// Stages ended by the early-exit signal
    pub skipped_stages: usize,

    /// Commands run, callables included
    pub commands: usize,

    /// Commands that exited non-zero
    pub failed_commands: usize,

    /// Per-command containers created
    pub containers: usize,
}

/// Metrics collector for one run
#[derive(Debug, Default)]
pub struct MetricsCollector {
    stages: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    commands: AtomicUsize,
    failed_commands: AtomicUsize,
    containers: AtomicUsize,
}

impl MetricsCollector {
    /// Creates a new metrics collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stage entry
    pub fn stage_entered(&self) {
        self.stages.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a stage's final state
    pub fn stage_finished(&self, state: StageState) {
        let counter = match state {
            StageState::Succeeded => &self.succeeded,
            StageState::Failed => &self.failed,
            StageState::SkippedByExit => &self.skipped,
            StageState::Pending | StageState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one command and whether it succeeded
    pub fn command_finished(&self, success: bool) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a per-command container
    pub fn container_created(&self) {
        self.containers.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values, stamped with `duration`
    #[must_use]
    pub fn snapshot(&self, duration: Duration) -> RunMetrics {
        RunMetrics {
            duration,
            stage_count: self.stages.load(Ordering::Relaxed),
            successful_stages: self.succeeded.load(Ordering::Relaxed),
            failed_stages: self.failed.load(Ordering::Relaxed),
            skipped_stages: self.skipped.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
            containers: self.containers.load(Ordering::Relaxed),
        }
    }
}
