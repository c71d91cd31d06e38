//! Log relay
//!
//! Wraps a [`RelayTransport`] with the behavior the pipeline needs: every line
//! is prefixed with the active stage, failed sends are retried with backoff
//! and then dropped with a local warning. Posting never fails the caller.
//! After several drops in a row the relay stops contacting the collector for
//! a cooldown period, so a dead collector cannot stall every stage.

use crate::infrastructure::runtime::{ContainerHandle, ContainerRuntime};
use crate::infrastructure::transport::{EventKind, RelayError, RelayEvent, RelayTransport};
use crate::pipeline::PipelineError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Retry behavior for relay sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub attempts: u32,
    /// Delay before the first retry, doubled after each
    pub base_delay_ms: u64,
    /// Consecutive drops that suspend delivery; 0 never suspends
    pub trip_after: u32,
    /// How long delivery stays suspended
    pub cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
            trip_after: 3,
            cooldown_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    #[must_use]
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            trip_after: 0,
            cooldown_ms: 0,
        }
    }

    /// Delay before retry number `retry` (zero based)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Relay client shared by the pipeline, its stages and log followers
pub struct Relay {
    transport: Arc<dyn RelayTransport>,
    retry: RetryPolicy,
    current_stage: RwLock<Option<String>>,
    dropped: AtomicUsize,
    failures_in_row: AtomicU32,
    suspended_until: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("transport", &self.transport.name())
            .field("retry", &self.retry)
            .field("current_stage", &*self.current_stage.read())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Creates a relay over `transport`
    pub fn new(transport: Arc<dyn RelayTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            current_stage: RwLock::new(None),
            dropped: AtomicUsize::new(0),
            failures_in_row: AtomicU32::new(0),
            suspended_until: Mutex::new(None),
        }
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Sets or clears the active stage
    pub fn set_current_stage(&self, stage: Option<&str>) {
        *self.current_stage.write() = stage.map(String::from);
    }

    /// Name of the active stage
    #[must_use]
    pub fn current_stage(&self) -> Option<String> {
        self.current_stage.read().clone()
    }

    /// Number of lines and events dropped after exhausting retries
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn prefixed(&self, message: &str) -> String {
        match self.current_stage.read().as_deref() {
            Some(stage) => format!("[{stage}] {message}"),
            None => message.to_string(),
        }
    }

    /// True while delivery is suspended after repeated drops
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let in_row = self.failures_in_row.fetch_add(1, Ordering::Relaxed) + 1;
        if self.retry.trip_after > 0 && in_row >= self.retry.trip_after {
            let cooldown = Duration::from_millis(self.retry.cooldown_ms);
            *self.suspended_until.lock() = Some(Instant::now() + cooldown);
            tracing::warn!(
                transport = self.transport.name(),
                failures = in_row,
                cooldown_ms = self.retry.cooldown_ms,
                "Collector unreachable, suspending relay delivery"
            );
        }
    }

    /// Runs `send` until it succeeds, fails permanently, or retries run out
    ///
    /// While suspended, messages are dropped without a send. The first
    /// message after the cooldown gets a single attempt; success resumes
    /// normal delivery.
    fn deliver(&self, what: &str, send: impl Fn() -> Result<(), RelayError>) -> bool {
        let probing = match *self.suspended_until.lock() {
            Some(until) if Instant::now() < until => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Relay suspended, dropped {what}");
                return false;
            }
            Some(_) => true,
            None => false,
        };
        let attempts = if probing { 1 } else { self.retry.attempts.max(1) };
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry.delay(attempt - 1));
            }
            match send() {
                Ok(()) => {
                    self.failures_in_row.store(0, Ordering::Relaxed);
                    if probing {
                        *self.suspended_until.lock() = None;
                        tracing::info!(transport = self.transport.name(), "Relay delivery resumed");
                    }
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "Relay send failed");
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        self.record_drop();
        if let Some(e) = last_error {
            tracing::warn!(
                transport = self.transport.name(),
                error = %e,
                "Dropped {what} after failed delivery"
            );
        }
        false
    }

    /// Posts one log line, prefixed with the active stage
    ///
    /// Returns false if the line was dropped.
    pub fn post_log(&self, message: &str) -> bool {
        let line = self.prefixed(message);
        if !self.transport.is_local() {
            tracing::info!(target: "danube::log", "{line}");
        }
        self.deliver("log line", || self.transport.send_log(&line))
    }

    /// Posts a status event attributed to the active stage
    pub fn post_event(&self, kind: EventKind, payload: serde_json::Value) -> bool {
        let event = RelayEvent::new(kind, self.current_stage(), payload);
        self.deliver("event", || self.transport.send_event(&event))
    }

    /// Registers the run as a job with the collector
    pub fn start_job(&self, info: &serde_json::Value) -> Option<String> {
        match self.transport.start_job(info) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Could not register job with collector");
                None
            }
        }
    }

    /// Marks a job complete
    pub fn complete_job(&self, job_id: &str) -> bool {
        self.deliver("job completion", || self.transport.complete_job(job_id))
    }

    /// Republishes a container's log through [`Relay::post_log`], in order
    ///
    /// Blocks until the stream ends; returns the number of lines relayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot open the log stream.
    pub fn stream_container_logs(
        &self,
        runtime: &dyn ContainerRuntime,
        handle: &ContainerHandle,
    ) -> Result<usize, PipelineError> {
        let mut count = 0;
        for line in runtime.stream_logs(handle)? {
            self.post_log(&line);
            count += 1;
        }
        Ok(count)
    }

    /// Follows a container's log on a background thread
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot open the log stream.
    pub fn follow(
        self: &Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        handle: ContainerHandle,
    ) -> Result<LogFollower, PipelineError> {
        let stream = runtime.stream_logs(&handle)?;
        let relay = Arc::clone(self);
        let container = handle.clone();

        let thread = std::thread::Builder::new()
            .name(format!("danube-logs-{}", handle.short_id()))
            .spawn(move || {
                let mut count = 0;
                for line in stream {
                    relay.post_log(&line);
                    count += 1;
                }
                count
            })?;

        tracing::debug!(container = %container, "Following container logs");
        Ok(LogFollower { container, thread })
    }
}

/// Background log republisher for one container
#[derive(Debug)]
pub struct LogFollower {
    container: ContainerHandle,
    thread: JoinHandle<usize>,
}

impl LogFollower {
    /// Container being followed
    #[must_use]
    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    /// Waits for the stream to drain; returns the number of lines relayed
    pub fn join(self) -> usize {
        match self.thread.join() {
            Ok(count) => count,
            Err(_) => {
                tracing::warn!(container = %self.container, "Log follower panicked");
                0
            }
        }
    }
}
