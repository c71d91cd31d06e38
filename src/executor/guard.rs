//! Scope guards for container cleanup

use crate::infrastructure::{ContainerHandle, ContainerRuntime};

/// Removes a per-command container when dropped
///
/// Covers every exit path out of a command: success, non-zero exit,
/// engine error and unwinding.
pub struct ContainerGuard<'r> {
    runtime: &'r dyn ContainerRuntime,
    handle: ContainerHandle,
}

impl<'r> ContainerGuard<'r> {
    /// Takes ownership of `handle`
    pub fn new(runtime: &'r dyn ContainerRuntime, handle: ContainerHandle) -> Self {
        Self { runtime, handle }
    }

    /// The guarded container
    #[must_use]
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.remove(&self.handle) {
            tracing::warn!(
                container = %self.handle,
                error = %e,
                "Failed to remove container, left for final cleanup"
            );
        }
    }
}

/// Force-removes every live container of a runtime when dropped
///
/// Held for the whole pipeline run so cleanup happens even if reporting
/// or the pipeline body panics.
pub struct CleanupGuard<'r> {
    runtime: &'r dyn ContainerRuntime,
}

impl<'r> CleanupGuard<'r> {
    /// Guards `runtime`
    pub fn new(runtime: &'r dyn ContainerRuntime) -> Self {
        Self { runtime }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        let removed = self.runtime.remove_all();
        if removed > 0 {
            tracing::info!(removed, "Final cleanup removed leftover containers");
        }
    }
}
