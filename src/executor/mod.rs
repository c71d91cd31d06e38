//! Pipeline execution layer
//!
//! The runner that owns a run, the worker pool for parallel sub-steps and
//! the guards that reclaim containers.

mod guard;
mod pool;
mod runner;

pub use guard::{CleanupGuard, ContainerGuard};
pub use pool::{Batch, WorkerId, WorkerPool};
pub use runner::{RunReport, Runner, RunnerBuilder};
