//! Interactive input
//!
//! Stages may ask a human for confirmation or free text. The wait is bounded:
//! lines are read on one helper thread per provider and each request gives
//! up after its own timeout.

use crate::pipeline::PipelineError;
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

/// Kind of input requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Yes/no question
    Confirm,
    /// Free text
    Text,
}

/// One request for input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    /// Kind of answer expected
    pub kind: InputKind,
    /// Short identifier
    pub name: String,
    /// Prompt shown to the user
    pub description: String,
    /// How long to wait
    pub timeout: Duration,
}

impl InputRequest {
    /// Creates a confirmation request
    pub fn confirm(name: impl Into<String>, description: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: InputKind::Confirm,
            name: name.into(),
            description: description.into(),
            timeout,
        }
    }

    /// Creates a free text request
    pub fn text(name: impl Into<String>, description: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: InputKind::Text,
            name: name.into(),
            description: description.into(),
            timeout,
        }
    }

    /// Answer returned in dry-run mode
    #[must_use]
    pub fn dry_run_answer(&self) -> InputValue {
        match self.kind {
            InputKind::Confirm => InputValue::Confirmed(true),
            InputKind::Text => InputValue::Text(format!("<dry-run:{}>", self.name)),
        }
    }

    fn timed_out(&self) -> PipelineError {
        PipelineError::InputTimeout {
            name: self.name.clone(),
            seconds: self.timeout.as_secs(),
        }
    }
}

/// Answer to an [`InputRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    /// Confirmation answer
    Confirmed(bool),
    /// Free text answer
    Text(String),
}

impl InputValue {
    /// Returns true for an affirmative confirmation
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(true))
    }

    /// Text answer, if any
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Confirmed(_) => None,
        }
    }
}

/// Source of interactive answers
#[allow(clippy::missing_errors_doc)]
pub trait InputProvider: Send + Sync {
    /// Blocks for an answer, up to the request's timeout
    fn request(&self, request: &InputRequest) -> Result<InputValue, PipelineError>;
}

/// Parses a yes/no answer
#[must_use]
pub fn parse_confirm(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true" | "1" | "ok"
    )
}

type Source = Box<dyn BufRead + Send>;

/// Prompts on stderr and reads answers from stdin
///
/// A single reader thread, started on the first request, owns the input and
/// forwards lines over a channel. A request that times out leaves the reader
/// in place, so the next request still gets the next line.
pub struct StdinInput {
    source: Mutex<Option<Source>>,
    lines: Mutex<Option<Receiver<io::Result<String>>>>,
    prompt: Mutex<Box<dyn Write + Send>>,
}

impl StdinInput {
    /// Reads from stdin, prompts on stderr
    #[must_use]
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(io::stdin()), io::stderr())
    }

    /// Reads answers from `reader` and writes prompts to `prompt`
    pub fn from_reader(
        reader: impl BufRead + Send + 'static,
        prompt: impl Write + Send + 'static,
    ) -> Self {
        Self {
            source: Mutex::new(Some(Box::new(reader))),
            lines: Mutex::new(None),
            prompt: Mutex::new(Box::new(prompt)),
        }
    }

    fn spawn_reader(mut source: Source) -> io::Result<Receiver<io::Result<String>>> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("danube-input".to_string())
            .spawn(move || {
                loop {
                    let mut line = String::new();
                    match source.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if tx.send(Ok(line)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                tracing::debug!("Input reader finished");
            })?;
        Ok(rx)
    }

    fn ask(&self, request: &InputRequest) -> io::Result<()> {
        let hint = match request.kind {
            InputKind::Confirm => " [y/N]",
            InputKind::Text => "",
        };
        let mut prompt = self.prompt.lock();
        write!(prompt, "{}{hint}: ", request.description)?;
        prompt.flush()
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StdinInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinInput")
            .field("started", &self.lines.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl InputProvider for StdinInput {
    fn request(&self, request: &InputRequest) -> Result<InputValue, PipelineError> {
        let mut lines = self.lines.lock();
        if lines.is_none() {
            if let Some(source) = self.source.lock().take() {
                *lines = Some(Self::spawn_reader(source)?);
            }
        }
        let Some(rx) = lines.as_ref() else {
            return Err(PipelineError::Io("input reader could not be started".into()));
        };

        self.ask(request)?;

        let answer = match rx.recv_timeout(request.timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => return Err(e.into()),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(input = %request.name, "No answer before timeout");
                return Err(request.timed_out());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PipelineError::Io(format!(
                    "input closed before '{}' was answered",
                    request.name
                )));
            }
        };

        Ok(match request.kind {
            InputKind::Confirm => InputValue::Confirmed(parse_confirm(&answer)),
            InputKind::Text => InputValue::Text(answer.trim_end().to_string()),
        })
    }
}

/// Provider that never answers; every request times out
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl InputProvider for NoInput {
    fn request(&self, request: &InputRequest) -> Result<InputValue, PipelineError> {
        Err(request.timed_out())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_confirm() {
        assert!(parse_confirm("y\n"));
        assert!(parse_confirm(" YES "));
        assert!(!parse_confirm("n"));
        assert!(!parse_confirm(""));
    }

    #[test]
    fn test_dry_run_answers() {
        let confirm = InputRequest::confirm("deploy", "Deploy?", Duration::from_secs(5));
        assert!(confirm.dry_run_answer().is_confirmed());

        let text = InputRequest::text("version", "Version", Duration::from_secs(5));
        assert_eq!(text.dry_run_answer().as_text(), Some("<dry-run:version>"));
    }

    #[test]
    fn test_no_input_times_out() {
        let request = InputRequest::confirm("deploy", "Deploy?", Duration::from_secs(30));
        let err = NoInput.request(&request).unwrap_err();
        assert_eq!(
            err,
            PipelineError::InputTimeout {
                name: "deploy".into(),
                seconds: 30
            }
        );
    }

    /// Reader fed line by line from the test
    struct ChannelReader {
        chunks: mpsc::Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl io::Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.chunks.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn fed_input() -> (StdinInput, mpsc::Sender<Vec<u8>>) {
        let (tx, chunks) = mpsc::channel();
        let reader = BufReader::new(ChannelReader {
            chunks,
            pending: Vec::new(),
        });
        (StdinInput::from_reader(reader, io::sink()), tx)
    }

    #[test]
    fn test_stdin_input_reads_answers_in_order() {
        let input = StdinInput::from_reader(io::Cursor::new("yes\nrelease-1\n"), io::sink());

        let confirm = InputRequest::confirm("deploy", "Deploy?", Duration::from_secs(5));
        assert_eq!(input.request(&confirm).unwrap(), InputValue::Confirmed(true));

        let text = InputRequest::text("tag", "Tag", Duration::from_secs(5));
        assert_eq!(input.request(&text).unwrap(), InputValue::Text("release-1".into()));
    }

    #[test]
    fn test_answer_after_timeout_reaches_next_request() {
        let (input, feed) = fed_input();

        let first = InputRequest::confirm("deploy", "Deploy?", Duration::from_millis(50));
        assert!(matches!(
            input.request(&first),
            Err(PipelineError::InputTimeout { .. })
        ));

        let typist = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            feed.send(b"y\n".to_vec()).unwrap();
            feed
        });
        let second = InputRequest::confirm("deploy", "Deploy?", Duration::from_secs(5));
        assert_eq!(input.request(&second).unwrap(), InputValue::Confirmed(true));
        drop(typist.join().unwrap());
    }

    #[test]
    fn test_closed_input_is_an_error_not_a_hang() {
        let input = StdinInput::from_reader(io::Cursor::new(""), io::sink());
        let request = InputRequest::text("tag", "Tag", Duration::from_secs(5));
        assert!(matches!(input.request(&request), Err(PipelineError::Io(_))));
    }
}
