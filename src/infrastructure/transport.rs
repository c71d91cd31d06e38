//! Relay transports
//!
//! A transport delivers log lines and status events to wherever the run is
//! being observed: an HTTP collector, the local tracing output, or memory.

use crate::infrastructure::runtime::HealthStatus;
use crate::pipeline::PipelineError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors from a relay transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Request could not be sent or no response arrived
    #[error("Request failed: {0}")]
    Request(String),

    /// Collector answered with a non-success status
    #[error("Collector returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Response body could not be parsed
    #[error("Invalid response: {0}")]
    Parse(String),

    /// Collector URL is invalid
    #[error("Invalid collector URL '{0}'")]
    InvalidUrl(String),
}

impl RelayError {
    /// Returns true if sending again may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) | Self::InvalidUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

impl From<RelayError> for PipelineError {
    fn from(err: RelayError) -> Self {
        Self::Relay(err.to_string())
    }
}

/// Kind of status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Pipeline scope opened
    PipelineStarted,
    /// Pipeline scope closed; payload carries the final status
    PipelineFinished,
    /// Stage scope opened
    StageEntered,
    /// Stage body returned normally
    StageCompleted,
    /// Stage body returned a fault
    StageFailed,
    /// Stage body raised the early-exit signal
    StageSkipped,
    /// A command exited non-zero
    CommandFailed,
    /// Artifact pattern resolved to files
    ArtifactSaved,
    /// Artifact pattern matched nothing
    ArtifactMissing,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::PipelineStarted => "pipeline started",
            Self::PipelineFinished => "pipeline finished",
            Self::StageEntered => "stage entered",
            Self::StageCompleted => "stage completed",
            Self::StageFailed => "stage failed",
            Self::StageSkipped => "stage skipped",
            Self::CommandFailed => "command failed",
            Self::ArtifactSaved => "artifact saved",
            Self::ArtifactMissing => "artifact missing",
        };
        f.write_str(text)
    }
}

/// Structured status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Event kind
    pub kind: EventKind,
    /// Stage the event belongs to, if any
    pub stage: Option<String>,
    /// Event specific data
    pub payload: serde_json::Value,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
}

impl RelayEvent {
    /// Creates an event stamped now
    pub fn new(kind: EventKind, stage: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            stage,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// One-line human readable form
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.stage {
            Some(stage) => format!("[{stage}] {}", self.kind),
            None => self.kind.to_string(),
        }
    }
}

/// Sink for log lines and status events
#[allow(clippy::missing_errors_doc)]
pub trait RelayTransport: Send + Sync {
    /// Transport name, for logs
    fn name(&self) -> &str;

    /// Appends one log line
    fn send_log(&self, message: &str) -> Result<(), RelayError>;

    /// Sends one status event
    fn send_event(&self, event: &RelayEvent) -> Result<(), RelayError>;

    /// Registers a job; returns its id if the transport tracks jobs
    fn start_job(&self, _info: &serde_json::Value) -> Result<Option<String>, RelayError> {
        Ok(None)
    }

    /// Marks a job complete
    fn complete_job(&self, _job_id: &str) -> Result<(), RelayError> {
        Ok(())
    }

    /// Checks that the sink is reachable
    fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Returns true if lines sent here already show up in the local output
    fn is_local(&self) -> bool {
        false
    }
}

/// Transport that posts to a danube log collector over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    client: reqwest::blocking::Client,
}

/// Deadline for establishing a connection to the collector
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for one log, event or job request
const SEND_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Deserialize)]
struct JobStarted {
    job_id: serde_json::Value,
}

impl HttpTransport {
    /// Creates a transport for the collector at `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Option::<Duration>::None)
            .build()?;
        Self::with_client(base_url, client)
    }

    /// Creates a transport with a custom HTTP client
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn with_client(
        base_url: &str,
        client: reqwest::blocking::Client,
    ) -> Result<Self, RelayError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url =
            Url::parse(&normalized).map_err(|_| RelayError::InvalidUrl(base_url.to_string()))?;
        Ok(Self { base_url, client })
    }

    /// Base URL of the collector
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, RelayError> {
        self.base_url
            .join(path)
            .map_err(|_| RelayError::InvalidUrl(format!("{}{path}", self.base_url)))
    }

    fn check(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response, RelayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(RelayError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::blocking::Response, RelayError> {
        let response = self
            .client
            .post(self.endpoint(path)?)
            .timeout(SEND_TIMEOUT)
            .json(body)
            .send()?;
        Self::check(response)
    }

    /// Streams the collector's copy of a container's log
    ///
    /// Read side of the collector, used by `danube logs`. The stream has no
    /// overall deadline and ends when the collector closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub fn container_logs(
        &self,
        container_id: &str,
    ) -> Result<impl Iterator<Item = String> + Send + use<>, RelayError> {
        let url = self.endpoint(&format!("container/{container_id}/logs"))?;
        let response = Self::check(self.client.get(url).send()?)?;
        Ok(BufReader::new(response).lines().map_while(Result::ok))
    }
}

impl RelayTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send_log(&self, message: &str) -> Result<(), RelayError> {
        self.post_json("log", &serde_json::json!({ "message": message }))?;
        Ok(())
    }

    fn send_event(&self, event: &RelayEvent) -> Result<(), RelayError> {
        self.post_json(
            "log",
            &serde_json::json!({ "message": event.summary(), "event": event }),
        )?;
        Ok(())
    }

    fn start_job(&self, info: &serde_json::Value) -> Result<Option<String>, RelayError> {
        let started: JobStarted = self
            .post_json("job/start", &serde_json::json!({ "info": info }))?
            .json()
            .map_err(|e| RelayError::Parse(e.to_string()))?;

        let id = match started.job_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Some(id))
    }

    fn complete_job(&self, job_id: &str) -> Result<(), RelayError> {
        self.post_json(&format!("job/{job_id}/complete"), &serde_json::json!({}))?;
        Ok(())
    }

    fn health_check(&self) -> HealthStatus {
        match self.client.get(self.base_url.clone()).timeout(SEND_TIMEOUT).send() {
            Ok(response) if response.status().is_server_error() => HealthStatus::Degraded {
                reason: format!("collector returned {}", response.status()),
            },
            Ok(_) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("collector unreachable: {e}"),
            },
        }
    }
}

/// Transport that writes to the local tracing output
///
/// Used when no collector is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTransport;

impl RelayTransport for TracingTransport {
    fn name(&self) -> &str {
        "tracing"
    }

    fn send_log(&self, message: &str) -> Result<(), RelayError> {
        tracing::info!(target: "danube::relay", "{message}");
        Ok(())
    }

    fn send_event(&self, event: &RelayEvent) -> Result<(), RelayError> {
        tracing::debug!(
            target: "danube::relay",
            kind = %event.kind,
            stage = event.stage.as_deref().unwrap_or("-"),
            payload = %event.payload,
            "Event"
        );
        Ok(())
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Transport that keeps everything in memory
///
/// Can be told to fail the next few sends.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    logs: Mutex<Vec<String>>,
    events: Mutex<Vec<RelayEvent>>,
    jobs: Mutex<Vec<(String, bool)>>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    /// Creates an empty transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail with a retryable error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Recorded log lines
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    /// Recorded events
    #[must_use]
    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of one kind
    #[must_use]
    pub fn events_of(&self, kind: EventKind) -> Vec<RelayEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Jobs started, with their completion flag
    #[must_use]
    pub fn jobs(&self) -> Vec<(String, bool)> {
        self.jobs.lock().clone()
    }

    /// Total send attempts, failed ones included
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), RelayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RelayError::Request("injected failure".into()));
        }
        Ok(())
    }
}

impl RelayTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn send_log(&self, message: &str) -> Result<(), RelayError> {
        self.take_failure()?;
        self.logs.lock().push(message.to_string());
        Ok(())
    }

    fn send_event(&self, event: &RelayEvent) -> Result<(), RelayError> {
        self.take_failure()?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn start_job(&self, _info: &serde_json::Value) -> Result<Option<String>, RelayError> {
        let mut jobs = self.jobs.lock();
        let id = format!("job-{}", jobs.len() + 1);
        jobs.push((id.clone(), false));
        Ok(Some(id))
    }

    fn complete_job(&self, job_id: &str) -> Result<(), RelayError> {
        let mut jobs = self.jobs.lock();
        match jobs.iter_mut().find(|(id, _)| id == job_id) {
            Some(job) => {
                job.1 = true;
                Ok(())
            }
            None => Err(RelayError::Status {
                status: 404,
                body: format!("unknown job {job_id}"),
            }),
        }
    }
}
