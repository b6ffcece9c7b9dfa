//! Child process ownership.
//!
//! A [`ProcessHandle`] owns the child and its pipes. The pipes are exposed as
//! line-oriented halves so the client can hand the read side to a single
//! reader and the write side to a single writer.

use futures::StreamExt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use stdrpc_core::{ClientConfig, Error, Result, StderrMode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

/// How long shutdown lets the stderr forwarder drain after the child exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Write half of the child's stdio.
pub struct LineWriter {
    stdin: ChildStdin,
}

impl LineWriter {
    /// Write one line and flush it.
    ///
    /// A missing `\n` terminator is added. Any I/O failure means the child
    /// stopped reading and is reported as [`Error::BrokenPipe`].
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.stdin.write_all(line).await.map_err(Error::BrokenPipe)?;
        if !line.ends_with(b"\n") {
            self.stdin.write_all(b"\n").await.map_err(Error::BrokenPipe)?;
        }
        self.stdin.flush().await.map_err(Error::BrokenPipe)?;
        Ok(())
    }
}

/// Read half of the child's stdio.
pub struct LineReader {
    lines: FramedRead<ChildStdout, AnyDelimiterCodec>,
}

impl LineReader {
    fn new(stdout: ChildStdout, max_line_length: usize) -> Self {
        let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line_length);
        Self {
            lines: FramedRead::new(stdout, codec),
        }
    }

    /// Wait for the next line, without its terminator.
    ///
    /// Returns [`Error::EndOfStream`] once the child closed stdout. A line
    /// over the configured limit breaks framing and is reported as an I/O
    /// error.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        match self.lines.next().await {
            Some(Ok(line)) => Ok(line.to_vec()),
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => Err(Error::Io(
                io::Error::new(io::ErrorKind::InvalidData, "line from child exceeds max length"),
            )),
            Some(Err(AnyDelimiterCodecError::Io(e))) => Err(Error::Io(e)),
            None => Err(Error::EndOfStream),
        }
    }
}

/// An owned child process speaking line-delimited messages on stdio.
///
/// Dropping the handle kills the child.
pub struct ProcessHandle {
    program: String,
    child: Child,
    stdin: Option<LineWriter>,
    stdout: Option<LineReader>,
    stderr_task: Option<JoinHandle<()>>,
    grace: Duration,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Launch the configured program with piped stdin/stdout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match config.stderr {
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Null => Stdio::null(),
                StderrMode::Log => Stdio::piped(),
            })
            .kill_on_drop(true);

        if let Some(ref cwd) = config.cwd {
            command.current_dir(cwd);
        }

        // Windows: keep the child from opening a console window
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: config.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Spawn {
            program: config.program.clone(),
            source: io::Error::new(io::ErrorKind::Other, "failed to capture stdin"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
            program: config.program.clone(),
            source: io::Error::new(io::ErrorKind::Other, "failed to capture stdout"),
        })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(config.program.clone(), stderr)));

        tracing::debug!(
            program = %config.program,
            args = ?config.args,
            pid = ?child.id(),
            "spawned child process"
        );

        Ok(Self {
            program: config.program.clone(),
            child,
            stdin: Some(LineWriter { stdin }),
            stdout: Some(LineReader::new(stdout, config.max_line_length)),
            stderr_task,
            grace: config.shutdown_grace(),
            exit_status: None,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// OS process id, `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the write half. Once taken, closing stdin is up to its owner.
    pub fn take_writer(&mut self) -> Option<LineWriter> {
        self.stdin.take()
    }

    /// Take the read half. Once taken, its owner is the only reader.
    pub fn take_reader(&mut self) -> Option<LineReader> {
        self.stdout.take()
    }

    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        match self.stdin.as_mut() {
            Some(writer) => writer.write_line(line).await,
            None => Err(Error::BrokenPipe(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin is closed or owned elsewhere",
            ))),
        }
    }

    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        match self.stdout.as_mut() {
            Some(reader) => reader.read_line().await,
            None => Err(Error::EndOfStream),
        }
    }

    /// Non-blocking check for child exit.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait()?;
        }
        Ok(self.exit_status)
    }

    /// Close the pipes and reap the child.
    ///
    /// Waits up to the grace period for the child to exit on its own after
    /// stdin closes, then kills it. Calling it again returns the recorded
    /// exit status.
    pub async fn shutdown(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        self.stdin = None;
        self.stdout = None;

        let status = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(
                    program = %self.program,
                    grace_ms = self.grace.as_millis() as u64,
                    "child did not exit within grace period, killing"
                );
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }

        tracing::debug!(program = %self.program, ?status, "child process exited");
        self.exit_status = Some(status);
        Ok(status)
    }
}

async fn forward_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "stdrpc::child", program = %program, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(program = %program, "stopped reading child stderr: {}", e);
                break;
            }
        }
    }
}
