//! External command execution with hard time limits.
//!
//! Commands are spawned from an argument vector, never through a shell. A
//! command that outlives its limit is killed and reported as
//! [`BuildError::Timeout`], which callers treat differently from a non-zero
//! exit ([`BuildError::CommandFailed`]).
//!
//! Output is read as bytes and decoded lossily, so a tool that prints invalid
//! UTF-8 still has its pipes drained to the end.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{BuildError, BuildResult};

/// Default limit for any single external command: 7 minutes.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(7 * 60);

/// Lines of output kept in a failure message.
const FAILURE_TAIL_LINES: usize = 20;

/// A command to execute.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Hard time limit.
    pub timeout: Duration,
}

impl CommandSpec {
    /// Create a command with the default time limit.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    /// Human-readable command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output from a command that exited successfully.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Runs external commands with a default time limit.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessRunner {
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Start building a command that uses this runner's time limit.
    #[must_use]
    pub fn command(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program).timeout(self.default_timeout)
    }

    /// Run to completion, capturing stdout and stderr.
    #[instrument(skip(self, spec), fields(command = %spec.display()))]
    pub async fn run(&self, spec: &CommandSpec) -> BuildResult<ProcessOutput> {
        execute(spec, None).await
    }

    /// Run to completion, forwarding every stdout and stderr line to `lines`
    /// as it is produced.
    ///
    /// A closed receiver does not stop the command.
    #[instrument(skip(self, spec, lines), fields(command = %spec.display()))]
    pub async fn run_streaming(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> BuildResult<ProcessOutput> {
        execute(spec, Some(lines)).await
    }
}

async fn execute(
    spec: &CommandSpec,
    sink: Option<mpsc::Sender<String>>,
) -> BuildResult<ProcessOutput> {
    let mut cmd = TokioCommand::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    debug!("spawning command");
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| BuildError::Spawn {
        program: spec.program.clone(),
        message: e.to_string(),
    })?;

    let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), sink.clone()));
    let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), sink));

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(BuildError::Spawn {
                program: spec.program.clone(),
                message: format!("wait failed: {e}"),
            });
        }
        Err(_) => {
            warn!(limit_secs = spec.timeout.as_secs(), "command timed out, killing");
            child.kill().await.ok();
            // A surviving grandchild can keep the pipes open. Drop the
            // readers so the output sink closes now.
            stdout_task.abort();
            stderr_task.abort();
            return Err(BuildError::Timeout {
                program: spec.program.clone(),
                limit: spec.timeout,
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let duration = start.elapsed();
    let exit_code = status.code().unwrap_or(-1);

    if !status.success() {
        let detail = if stderr.is_empty() { &stdout } else { &stderr };
        return Err(BuildError::CommandFailed {
            program: spec.program.clone(),
            exit_code,
            stderr: tail(detail),
        });
    }

    debug!(duration_ms = duration.as_millis(), "command finished");

    Ok(ProcessOutput {
        stdout: stdout.join("\n"),
        stderr: stderr.join("\n"),
        exit_code,
        duration,
    })
}

async fn collect_lines<R>(reader: Option<R>, sink: Option<mpsc::Sender<String>>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if let Some(sink) = &sink {
                    let _ = sink.send(line.clone()).await;
                }
                collected.push(line);
            }
            Err(e) => {
                debug!(error = %e, "stopped reading command output");
                break;
            }
        }
    }
    collected
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn tail(lines: &[String]) -> String {
    let skip = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    lines[skip..].join("\n")
}
