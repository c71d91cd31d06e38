//! `danube logs` - Read a container's log back from the collector

use crate::infrastructure::{Config, HttpTransport};
use anyhow::{Context, Result};
use std::io::Write;

/// Copies the collector's log for `container_id` to `out`
///
/// # Errors
///
/// Returns an error if no collector is configured, the request fails, or
/// `out` cannot be written.
pub fn show_logs(config: &Config, container_id: &str, out: &mut impl Write) -> Result<usize> {
    let url = config
        .relay_url
        .as_deref()
        .context("no collector configured, set relay_url or DANUBE_SERVER_URL")?;
    let transport = HttpTransport::new(url).with_context(|| format!("invalid collector URL {url}"))?;
    let lines = transport
        .container_logs(container_id)
        .with_context(|| format!("cannot read logs of {container_id} from {url}"))?;
    copy_lines(lines, out)
}

fn copy_lines(lines: impl Iterator<Item = String>, out: &mut impl Write) -> Result<usize> {
    let mut count = 0;
    for line in lines {
        writeln!(out, "{line}").context("cannot write log line")?;
        count += 1;
    }
    out.flush().context("cannot flush log output")?;
    tracing::debug!(lines = count, "Copied collector log");
    Ok(count)
}
