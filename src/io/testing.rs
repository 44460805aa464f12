//! Scripted process runner for tests
//!
//! Hands each started command to the test as a [`ScriptedProcess`], which
//! controls stdout/stderr contents, observes stdin and decides the exit status.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::{mpsc, oneshot};

use crate::io::process::{
    CommandRunner, CommandSpec, ProcessError, ProcessExit, ProcessHandle, ProcessParts,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Test-side controller of one scripted process
pub struct ScriptedProcess {
    /// Command the runner was asked to start
    pub command: CommandSpec,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: mpsc::UnboundedReceiver<Vec<u8>>,
    stdin_buffer: Vec<u8>,
    kill_switch: oneshot::Receiver<()>,
    exit: Option<oneshot::Sender<ProcessExit>>,
}

impl ScriptedProcess {
    /// Write one stdout line
    pub async fn emit(&mut self, line: &str) {
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }
    }

    /// Write one stderr line
    pub async fn emit_stderr(&mut self, line: &str) {
        if let Some(stderr) = self.stderr.as_mut() {
            stderr.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }
    }

    /// Close both output streams and report the exit code
    pub fn exit(&mut self, code: i32) {
        self.stdout.take();
        self.stderr.take();
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(ProcessExit::with_code(code));
        }
    }

    /// Next complete stdin line, `None` once stdin is closed
    pub async fn next_input_line(&mut self) -> Option<String> {
        loop {
            if let Some(index) = self.stdin_buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.stdin_buffer.drain(..=index).collect();
                return Some(String::from_utf8_lossy(&line[..index]).into_owned());
            }
            let chunk = self.stdin.recv().await?;
            self.stdin_buffer.extend_from_slice(&chunk);
        }
    }

    /// Wait until the handle kills the process (or drops it)
    pub async fn killed(&mut self) {
        let _ = (&mut self.kill_switch).await;
    }
}

/// Runner that produces [`ScriptedProcess`] controllers instead of OS processes
pub struct ScriptedRunner {
    processes: Option<mpsc::UnboundedSender<ScriptedProcess>>,
}

impl ScriptedRunner {
    /// Create a runner and the receiver on which started processes arrive
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScriptedProcess>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                processes: Some(sender),
            },
            receiver,
        )
    }

    /// Runner whose every start fails as if the program did not exist
    pub fn failing() -> Self {
        Self { processes: None }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn start(&self, command: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        let Some(processes) = &self.processes else {
            return Err(ProcessError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        };

        let (stdout_writer, stdout_reader) = duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = duplex(PIPE_CAPACITY);
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (kill_sender, kill_receiver) = oneshot::channel();
        let (exit_sender, exit_receiver) = oneshot::channel();

        let process = ScriptedProcess {
            command: command.clone(),
            stdout: Some(stdout_writer),
            stderr: Some(stderr_writer),
            stdin: stdin_receiver,
            stdin_buffer: Vec::new(),
            kill_switch: kill_receiver,
            exit: Some(exit_sender),
        };
        processes
            .send(process)
            .map_err(|_| ProcessError::Io(std::io::Error::other("scripted runner closed")))?;

        Ok(ProcessHandle::from_parts(ProcessParts {
            pid: None,
            stdin: stdin_sender,
            stdout: Box::new(stdout_reader),
            stderr: Box::new(stderr_reader),
            kill_switch: kill_sender,
            exit: exit_receiver,
        }))
    }
}
