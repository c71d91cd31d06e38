//! `danube cleanup` - Remove containers left behind by earlier runs
//!
//! Every container danube creates carries the `danube.managed=true` label;
//! this removes all of them, whichever run created them.

use crate::infrastructure::CliRuntime;
use anyhow::{Context, Result};

/// Lists or removes every managed container; returns how many were found or removed
///
/// # Errors
///
/// Returns an error if the engine cannot be queried.
pub fn cleanup(runtime: &CliRuntime, dry_run: bool) -> Result<usize> {
    if dry_run {
        let ids = runtime
            .list_managed()
            .context("Failed to list managed containers")?;
        for id in &ids {
            println!("would remove {id}");
        }
        return Ok(ids.len());
    }

    runtime
        .remove_managed()
        .context("Failed to remove managed containers")
}
