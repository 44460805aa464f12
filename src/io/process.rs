//! Process management layer
//!
//! Spawns external programs and exposes their stdio as raw byte streams,
//! completely separate from framing and protocol concerns.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Command Description
// ============================================================================

/// Executable plus arguments, working directory and extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute (resolved through `PATH` when not absolute)
    pub program: String,

    /// Command line arguments
    pub args: Vec<String>,

    /// Working directory for the process (optional)
    pub working_directory: Option<PathBuf>,

    /// Additional environment variables, layered over the inherited environment
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            env: Vec::new(),
        }
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Process Exit
// ============================================================================

/// How a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when the process was terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Exit with the given status code
    #[cfg(test)]
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Termination without an exit code (signal, or status unavailable)
    pub fn signaled() -> Self {
        Self { code: None }
    }

    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

// ============================================================================
// Process Errors
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process stdin is closed")]
    StdinClosed,

    #[error("{0} not available")]
    NotAvailable(&'static str),
}

// ============================================================================
// Process Handle
// ============================================================================

/// Readable side of a process stream
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;

/// Raw pieces a runner assembles into a [`ProcessHandle`]
pub struct ProcessParts {
    pub pid: Option<u32>,
    pub stdin: mpsc::UnboundedSender<Vec<u8>>,
    pub stdout: ProcessReader,
    pub stderr: ProcessReader,
    pub kill_switch: oneshot::Sender<()>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Exclusive handle to one running process
///
/// Dropping the handle without calling [`ProcessHandle::kill`] still tears the
/// process down: the supervising task treats a dropped kill switch as a kill.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stdout: Option<ProcessReader>,
    stderr: Option<ProcessReader>,
    kill_switch: Option<oneshot::Sender<()>>,
    exit: Option<oneshot::Receiver<ProcessExit>>,
    exit_status: Option<ProcessExit>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("input_open", &self.stdin.is_some())
            .field("killed", &self.kill_switch.is_none())
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

impl ProcessHandle {
    /// Assemble a handle from runner-provided parts
    pub fn from_parts(parts: ProcessParts) -> Self {
        Self {
            pid: parts.pid,
            stdin: Some(parts.stdin),
            stdout: Some(parts.stdout),
            stderr: Some(parts.stderr),
            kill_switch: Some(parts.kill_switch),
            exit: Some(parts.exit),
            exit_status: None,
        }
    }

    /// Get the process ID (if known)
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Enqueue bytes for the process's stdin
    ///
    /// Fails with [`ProcessError::StdinClosed`] after [`ProcessHandle::end`]
    /// or once the writer task has stopped.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ProcessError> {
        let sender = self.stdin.as_ref().ok_or(ProcessError::StdinClosed)?;
        sender
            .send(bytes.into())
            .map_err(|_| ProcessError::StdinClosed)
    }

    /// Close stdin, signaling that no more input follows
    pub fn end(&mut self) {
        if self.stdin.take().is_some() {
            trace!("ProcessHandle: stdin closed for PID {:?}", self.pid);
        }
    }

    /// Whether stdin still accepts writes
    #[cfg(test)]
    pub fn is_input_open(&self) -> bool {
        self.stdin.as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Take the raw stdout stream (only once)
    pub fn take_stdout(&mut self) -> Result<ProcessReader, ProcessError> {
        self.stdout.take().ok_or(ProcessError::NotAvailable("stdout"))
    }

    /// Take the raw stderr stream (only once)
    pub fn take_stderr(&mut self) -> Result<ProcessReader, ProcessError> {
        self.stderr.take().ok_or(ProcessError::NotAvailable("stderr"))
    }

    /// Forcibly terminate the process
    ///
    /// Idempotent: only the first call signals the supervisor.
    pub fn kill(&mut self) {
        self.end();
        if let Some(switch) = self.kill_switch.take() {
            debug!("ProcessHandle: kill requested for PID {:?}", self.pid);
            // The supervisor may already be gone if the process exited
            let _ = switch.send(());
        }
    }

    /// Whether [`ProcessHandle::kill`] has been called
    #[cfg(test)]
    pub fn is_killed(&self) -> bool {
        self.kill_switch.is_none()
    }

    /// Wait for the process to exit
    ///
    /// Cancel safe; the status is cached so repeated calls return it again.
    pub async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let receiver = self.exit.as_mut().ok_or(ProcessError::NotAvailable("exit status"))?;
        let status = receiver.await.map_err(|_| {
            ProcessError::Io(io::Error::other("process supervisor stopped without exit status"))
        })?;

        self.exit = None;
        self.exit_status = Some(status);
        Ok(status)
    }
}

// ============================================================================
// Command Runner
// ============================================================================

/// Trait for starting external processes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Start `command`, returning a handle over its stdio
    ///
    /// Never returns a partially started process: any failure is reported
    /// as an error before a handle exists.
    async fn start(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError>;
}

/// Runs commands as tokio child processes
#[derive(Debug, Clone, Default)]
pub struct ChildProcessRunner;

impl ChildProcessRunner {
    /// Create a new child process runner
    pub fn new() -> Self {
        Self
    }

    /// Background task that writes queued chunks to stdin
    async fn stdin_writer_task(mut stdin: ChildStdin, mut receiver: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(chunk) = receiver.recv().await {
            trace!("ChildProcessRunner: Writing {} bytes to stdin", chunk.len());

            if let Err(e) = stdin.write_all(&chunk).await {
                warn!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                warn!("Failed to flush stdin: {}", e);
                break;
            }
        }

        // Dropping stdin here delivers EOF to the child
        trace!("ChildProcessRunner: stdin writer task finished");
    }

    /// Background task that owns the child until it exits or is killed
    async fn supervise(
        mut child: Child,
        pid: Option<u32>,
        mut kill_switch: oneshot::Receiver<()>,
        exit_sender: oneshot::Sender<ProcessExit>,
    ) {
        trace!("ChildProcessRunner: Starting wait task for PID {:?}", pid);

        let status = tokio::select! {
            status = child.wait() => status,
            // Explicit kill or a dropped handle both end the process
            _ = &mut kill_switch => {
                info!("Killing process with PID: {:?}", pid);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill process {:?}: {}", pid, e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => {
                info!("Process PID {:?} exited with status: {}", pid, status);
                ProcessExit::from(status)
            }
            Err(e) => {
                error!("Error waiting for child process: {}", e);
                ProcessExit::signaled()
            }
        };

        if exit_sender.send(exit).is_err() {
            trace!("ChildProcessRunner: exit status for PID {:?} had no listener", pid);
        }

        trace!("ChildProcessRunner: Wait task finished for PID {:?}", pid);
    }
}

#[async_trait]
impl CommandRunner for ChildProcessRunner {
    async fn start(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        info!("Starting process: {}", command);

        let mut command_builder = Command::new(&command.program);
        command_builder
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &command.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let pid = child.id();
        info!("Process started with PID: {:?}", pid);

        // Extract stdio streams before moving child to the wait task;
        // on failure the child is dropped and killed by kill_on_drop
        let stdin = child.stdin.take().ok_or(ProcessError::NotAvailable("stdin"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::NotAvailable("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::NotAvailable("stderr"))?;

        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (kill_sender, kill_receiver) = oneshot::channel();
        let (exit_sender, exit_receiver) = oneshot::channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::supervise(child, pid, kill_receiver, exit_sender));

        Ok(ProcessHandle::from_parts(ProcessParts {
            pid,
            stdin: stdin_sender,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            kill_switch: kill_sender,
            exit: exit_receiver,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    async fn read_all(reader: &mut ProcessReader) -> String {
        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        output
    }

    #[tokio::test]
    async fn test_start_and_read_stdout() {
        let runner = ChildProcessRunner::new();
        let mut handle = runner
            .start(&CommandSpec::new("echo").args(["hello"]))
            .await
            .unwrap();

        assert!(handle.pid().is_some());

        let mut stdout = handle.take_stdout().unwrap();
        assert_eq!(read_all(&mut stdout).await, "hello\n");

        let exit = handle.wait().await.unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let runner = ChildProcessRunner::new();
        let result = runner
            .start(&CommandSpec::new("/nonexistent/resolver-binary"))
            .await;

        match result {
            Err(ProcessError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/resolver-binary");
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_then_end_reaches_process() {
        let runner = ChildProcessRunner::new();
        let mut handle = runner.start(&CommandSpec::new("cat")).await.unwrap();

        handle.write("ping\n").unwrap();
        handle.write(b"pong\n".to_vec()).unwrap();
        handle.end();

        assert!(!handle.is_input_open());
        assert!(matches!(handle.write("late\n"), Err(ProcessError::StdinClosed)));

        let mut stdout = handle.take_stdout().unwrap();
        assert_eq!(read_all(&mut stdout).await, "ping\npong\n");
        assert!(handle.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let runner = ChildProcessRunner::new();
        let mut handle = runner.start(&sh("exit 3")).await.unwrap();

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, ProcessExit::with_code(3));
        assert!(!exit.success());

        // Cached on repeated waits
        assert_eq!(handle.wait().await.unwrap(), exit);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let runner = ChildProcessRunner::new();
        let mut handle = runner.start(&CommandSpec::new("sleep").args(["30"])).await.unwrap();

        assert!(!handle.is_killed());
        handle.kill();
        handle.kill();
        assert!(handle.is_killed());

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("killed process should exit promptly")
            .unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_streams_can_only_be_taken_once() {
        let runner = ChildProcessRunner::new();
        let mut handle = runner.start(&sh("true")).await.unwrap();

        assert!(handle.take_stdout().is_ok());
        assert!(matches!(
            handle.take_stdout(),
            Err(ProcessError::NotAvailable("stdout"))
        ));
        assert!(handle.take_stderr().is_ok());
        assert!(handle.take_stderr().is_err());
    }

    #[tokio::test]
    async fn test_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ChildProcessRunner::new();
        let command = sh("printf '%s:%s' \"$RESOLVER_TEST_VAR\" \"$(pwd)\"")
            .env("RESOLVER_TEST_VAR", "value")
            .current_dir(dir.path());

        let mut handle = runner.start(&command).await.unwrap();
        let mut stdout = handle.take_stdout().unwrap();
        let output = read_all(&mut stdout).await;

        let expected_dir = dir.path().canonicalize().unwrap();
        let (var, cwd) = output.split_once(':').unwrap();
        assert_eq!(var, "value");
        assert_eq!(
            std::path::Path::new(cwd).canonicalize().unwrap(),
            expected_dir
        );
    }

    #[test]
    fn test_command_display_and_exit_display() {
        let command = CommandSpec::new("resolver").args(["--mode", "fast"]);
        assert_eq!(command.to_string(), "resolver --mode fast");

        assert_eq!(ProcessExit::with_code(1).to_string(), "exit code 1");
        assert_eq!(ProcessExit::signaled().to_string(), "terminated by signal");
        assert!(!ProcessExit::signaled().success());
    }
}
