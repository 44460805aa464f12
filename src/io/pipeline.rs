//! Process pipeline
//!
//! Composes a started process with [`LineFramer`] into a single-pass
//! sequence of lines that ends with exactly one terminal event.

use bytes::BytesMut;
use futures::StreamExt;
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace, warn};

use crate::io::framing::{DEFAULT_MAX_LINE_BYTES, FramingError, LineFramer};
use crate::io::process::{
    CommandRunner, CommandSpec, ProcessError, ProcessExit, ProcessHandle, ProcessReader,
};

// ============================================================================
// Pipeline Options
// ============================================================================

/// What to do with output on the process's error channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrPolicy {
    /// The first non-blank stderr line terminates the pipeline with an error
    #[default]
    Fatal,
    /// Stderr lines are logged and otherwise ignored
    Log,
}

impl FromStr for StderrPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown stderr policy '{other}' (expected 'fatal' or 'log')")),
        }
    }
}

impl fmt::Display for StderrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Log => write!(f, "log"),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Maximum accepted line length on stdout and stderr
    pub max_line_bytes: usize,

    /// Handling of stderr output
    pub stderr_policy: StderrPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            stderr_policy: StderrPolicy::default(),
        }
    }
}

// ============================================================================
// Pipeline Events and Errors
// ============================================================================

/// Error types for the process pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Process wrote to stderr: {0}")]
    Stderr(String),

    #[error("Process exited unsuccessfully: {exit}")]
    Exit { exit: ProcessExit },
}

/// One item of the pipeline sequence
#[derive(Debug)]
pub enum PipelineEvent {
    /// A decoded stdout line
    Line(String),
    /// The process exited with status 0 after flushing its output
    End,
    /// The process failed; no further lines follow
    Error(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Open,
    Finished,
    Aborted,
}

// ============================================================================
// Process Pipeline
// ============================================================================

/// Single-pass line stream over one exclusively owned process
pub struct ProcessPipeline {
    process: ProcessHandle,
    stdout: FramedRead<ProcessReader, LineFramer>,
    stderr: FramedRead<ProcessReader, LineFramer>,
    stdout_done: bool,
    stderr_done: bool,
    stderr_policy: StderrPolicy,
    state: PipelineState,
}

impl fmt::Debug for ProcessPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPipeline")
            .field("process", &self.process)
            .field("stdout_done", &self.stdout_done)
            .field("stderr_done", &self.stderr_done)
            .field("stderr_policy", &self.stderr_policy)
            .field("state", &self.state)
            .finish()
    }
}

impl ProcessPipeline {
    /// Start `command` through `runner` and wrap its output
    pub async fn open(
        runner: &dyn CommandRunner,
        command: &CommandSpec,
        options: &PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let mut process = runner.start(command).await?;
        let stdout = process.take_stdout()?;
        let stderr = process.take_stderr()?;

        debug!(
            "ProcessPipeline: opened for PID {:?} (stderr policy: {})",
            process.pid(),
            options.stderr_policy
        );

        Ok(Self {
            process,
            stdout: FramedRead::new(stdout, LineFramer::with_max_line_bytes(options.max_line_bytes)),
            stderr: FramedRead::new(stderr, LineFramer::with_max_line_bytes(options.max_line_bytes)),
            stdout_done: false,
            stderr_done: false,
            stderr_policy: options.stderr_policy,
            state: PipelineState::Open,
        })
    }

    /// Next line or terminal event
    ///
    /// Returns `None` once a terminal event has been delivered or after
    /// [`ProcessPipeline::abort`]. Exit status is only consulted after stdout
    /// and stderr have both reached end of stream, so every flushed line is
    /// delivered before `End`.
    pub async fn next(&mut self) -> Option<PipelineEvent> {
        if self.state != PipelineState::Open {
            return None;
        }

        loop {
            tokio::select! {
                biased;

                line = self.stdout.next(), if !self.stdout_done => match line {
                    Some(Ok(line)) => return Some(PipelineEvent::Line(line)),
                    Some(Err(e)) => return Some(self.fail(e.into())),
                    None => {
                        trace!("ProcessPipeline: stdout reached EOF");
                        self.stdout_done = true;
                        // Nothing can answer further input
                        self.end_input();
                    }
                },

                line = self.stderr.next(), if !self.stderr_done => match line {
                    Some(Ok(line)) => {
                        // Whitespace-only stderr output is never fatal
                        if line.trim().is_empty() {
                            continue;
                        }
                        match self.stderr_policy {
                            StderrPolicy::Fatal => {
                                return Some(self.fail(PipelineError::Stderr(line)));
                            }
                            StderrPolicy::Log => {
                                warn!("ProcessPipeline: stderr from PID {:?}: {}", self.process.pid(), line);
                            }
                        }
                    }
                    Some(Err(e)) => match self.stderr_policy {
                        StderrPolicy::Fatal => return Some(self.fail(e.into())),
                        StderrPolicy::Log => {
                            warn!("ProcessPipeline: unreadable stderr, ignoring the rest: {}", e);
                            self.stderr_done = true;
                        }
                    },
                    None => {
                        trace!("ProcessPipeline: stderr reached EOF");
                        self.stderr_done = true;
                    }
                },

                exit = self.process.wait(), if self.stdout_done && self.stderr_done => {
                    self.state = PipelineState::Finished;
                    return Some(match exit {
                        Ok(exit) if exit.success() => {
                            debug!("ProcessPipeline: process completed successfully");
                            PipelineEvent::End
                        }
                        Ok(exit) => PipelineEvent::Error(PipelineError::Exit { exit }),
                        Err(e) => PipelineEvent::Error(e.into()),
                    });
                }
            }
        }
    }

    /// Write one line (terminator appended) to the process's stdin
    pub fn write_line(&self, line: &str) -> Result<(), PipelineError> {
        let mut buffer = BytesMut::with_capacity(line.len() + 1);
        LineFramer::new().encode(line.to_string(), &mut buffer)?;
        self.write(buffer.to_vec())
    }

    /// Write raw bytes to the process's stdin
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), PipelineError> {
        Ok(self.process.write(bytes)?)
    }

    /// Close the process's stdin
    pub fn end_input(&mut self) {
        self.process.end();
    }

    /// Stop emitting lines and kill the process
    ///
    /// Safe to call repeatedly and after natural completion.
    pub fn abort(&mut self) {
        if self.state == PipelineState::Open {
            debug!("ProcessPipeline: aborting PID {:?}", self.process.pid());
            self.state = PipelineState::Aborted;
        }
        self.process.kill();
    }

    /// Whether the sequence is exhausted
    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.state != PipelineState::Open
    }

    /// Process ID of the underlying process (if known)
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    fn fail(&mut self, error: PipelineError) -> PipelineEvent {
        debug!("ProcessPipeline: terminating with error: {}", error);
        self.state = PipelineState::Finished;
        self.process.kill();
        PipelineEvent::Error(error)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::ChildProcessRunner;
    use std::time::Duration;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    async fn open(script: &str, options: PipelineOptions) -> ProcessPipeline {
        ProcessPipeline::open(&ChildProcessRunner::new(), &sh(script), &options)
            .await
            .unwrap()
    }

    async fn drain(pipeline: &mut ProcessPipeline) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(10), pipeline.next())
                .await
                .expect("pipeline stalled")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_lines_then_end() {
        let mut pipeline = open("printf 'a\\nb\\nc'", PipelineOptions::default()).await;
        let events = drain(&mut pipeline).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], PipelineEvent::Line(l) if l == "a"));
        assert!(matches!(&events[1], PipelineEvent::Line(l) if l == "b"));
        assert!(matches!(&events[2], PipelineEvent::Line(l) if l == "c"));
        assert!(matches!(events[3], PipelineEvent::End));
        assert!(pipeline.is_finished());
        assert!(pipeline.next().await.is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_single_error() {
        let mut pipeline = open("exit 1", PipelineOptions::default()).await;
        let events = drain(&mut pipeline).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Error(PipelineError::Exit { exit }) => {
                assert_eq!(exit.code, Some(1));
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_before_failure_is_delivered() {
        let mut pipeline = open("echo partial; exit 2", PipelineOptions::default()).await;
        let events = drain(&mut pipeline).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PipelineEvent::Line(l) if l == "partial"));
        assert!(matches!(
            events[1],
            PipelineEvent::Error(PipelineError::Exit { .. })
        ));
    }

    #[tokio::test]
    async fn test_stderr_is_fatal_by_default() {
        let mut pipeline = open("echo oops >&2; sleep 30", PipelineOptions::default()).await;
        let events = drain(&mut pipeline).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            PipelineEvent::Error(PipelineError::Stderr(line)) if line == "oops"
        ));
        assert!(pipeline.process.is_killed());
    }

    #[tokio::test]
    async fn test_stderr_log_policy_keeps_streaming() {
        let options = PipelineOptions {
            stderr_policy: StderrPolicy::Log,
            ..PipelineOptions::default()
        };
        let mut pipeline = open("echo warning >&2; echo out", options).await;
        let events = drain(&mut pipeline).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PipelineEvent::Line(l) if l == "out"));
        assert!(matches!(events[1], PipelineEvent::End));
    }

    #[tokio::test]
    async fn test_abort_kills_process_and_stops_lines() {
        let mut pipeline = open("echo ready; sleep 30", PipelineOptions::default()).await;

        assert!(matches!(pipeline.next().await, Some(PipelineEvent::Line(l)) if l == "ready"));

        pipeline.abort();
        pipeline.abort();
        assert!(pipeline.is_finished());
        assert!(pipeline.next().await.is_none());

        let exit = tokio::time::timeout(Duration::from_secs(5), pipeline.process.wait())
            .await
            .expect("aborted process should exit")
            .unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_abort_after_completion_is_harmless() {
        let mut pipeline = open("true", PipelineOptions::default()).await;
        let events = drain(&mut pipeline).await;
        assert!(matches!(events.as_slice(), [PipelineEvent::End]));

        pipeline.abort();
        assert!(pipeline.next().await.is_none());
    }

    #[tokio::test]
    async fn test_write_line_passes_through_to_stdin() {
        let mut pipeline = open("read line; echo \"got $line\"", PipelineOptions::default()).await;

        pipeline.write_line("MATCH {\"id\":1}").unwrap();
        pipeline.end_input();

        let events = drain(&mut pipeline).await;
        assert!(matches!(&events[0], PipelineEvent::Line(l) if l == "got MATCH {\"id\":1}"));
        assert!(matches!(events[1], PipelineEvent::End));
    }

    #[tokio::test]
    async fn test_stdin_closed_once_stdout_ends() {
        // Would block on stdin forever if input stayed open
        let mut pipeline = open("exec 1>&-; cat >/dev/null", PipelineOptions::default()).await;

        let events = tokio::time::timeout(Duration::from_secs(5), drain(&mut pipeline))
            .await
            .expect("process should see end of input");
        assert!(matches!(events.as_slice(), [PipelineEvent::End]));
        assert!(pipeline.write_line("MATCH {}").is_err());
    }

    #[tokio::test]
    async fn test_write_line_rejects_embedded_newline() {
        let mut pipeline = open("cat", PipelineOptions::default()).await;

        let result = pipeline.write_line("MATCH\n{}");
        assert!(matches!(
            result,
            Err(PipelineError::Framing(FramingError::EmbeddedNewline))
        ));
        pipeline.abort();
    }

    #[tokio::test]
    async fn test_open_failure() {
        let result = ProcessPipeline::open(
            &ChildProcessRunner::new(),
            &CommandSpec::new("/nonexistent/resolver"),
            &PipelineOptions::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PipelineError::Process(ProcessError::Spawn { .. }))
        ));
    }

    #[test]
    fn test_stderr_policy_parsing() {
        assert_eq!("fatal".parse::<StderrPolicy>().unwrap(), StderrPolicy::Fatal);
        assert_eq!("LOG".parse::<StderrPolicy>().unwrap(), StderrPolicy::Log);
        assert!("ignore".parse::<StderrPolicy>().is_err());
        assert_eq!(StderrPolicy::Log.to_string(), "log");
    }
}
