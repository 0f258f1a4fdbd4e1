//! Process lifecycle state machine.
//!
//! [`ShellProcess`] drives one spawned command from creation through
//! stream communication to exit-status resolution and teardown. The
//! machine is written once against two small capability interfaces,
//! [`ProcessHandle`] for lifecycle and [`RawStream`](crate::RawStream)
//! for I/O, and the backend is chosen once, at construction, through
//! the [`ExecutionTarget`] variant.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stackprobe_retry::Retry;
use stackprobe_ssh::SshClient;
use tracing::{debug, trace, warn};

use crate::command::ShellCommand;
use crate::error::ShellError;
use crate::io::{IoInterest, ShellIo, select_io};
use crate::local;
use crate::params::ShellProcessParameters;
use crate::remote;

/// Best-effort drain budget applied by [`ShellProcess::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace window for an exit status to become observable after the
/// streams have drained.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle capability implemented by both backends.
pub trait ProcessHandle: Send {
    /// Non-blocking exit status probe; `None` while still running.
    fn poll_exit_status(&mut self) -> Option<i32>;

    /// Requests hard termination.
    fn kill(&mut self) -> io::Result<()>;
}

/// Backend spawn result: the lifecycle handle plus the wired streams.
pub(crate) struct SpawnedProcess {
    pub(crate) handle: Box<dyn ProcessHandle>,
    pub(crate) stdin: Option<ShellIo>,
    pub(crate) stdout: Option<ShellIo>,
    pub(crate) stderr: Option<ShellIo>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Where a process runs: the local machine or an SSH client.
///
/// Resolved once at process construction; there is no truthiness-based
/// dispatch anywhere downstream.
#[derive(Debug, Clone)]
pub enum ExecutionTarget {
    /// Spawn an OS subprocess on this machine.
    Local,
    /// Run the command over a channel of the given client.
    Ssh(Arc<SshClient>),
}

impl ExecutionTarget {
    /// Returns `true` for the local backend.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Returns the SSH client for remote targets.
    #[must_use]
    pub const fn ssh_client(&self) -> Option<&Arc<SshClient>> {
        match self {
            Self::Local => None,
            Self::Ssh(client) => Some(client),
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Ssh(client) => f.write_str(&client.login()),
        }
    }
}

/// One spawned command instance.
///
/// Lifecycle: spawned → \[running: read/write rounds via
/// [`communicate`](Self::communicate)\] → terminated (exit status
/// observed or killed) → closed. Once the exit status has been observed
/// it is cached and never re-polled; [`close`](Self::close) is
/// idempotent.
pub struct ShellProcess {
    parameters: ShellProcessParameters,
    resolved_command: ShellCommand,
    target: ExecutionTarget,
    handle: Box<dyn ProcessHandle>,
    stdin: Option<ShellIo>,
    stdout: Option<ShellIo>,
    stderr: Option<ShellIo>,
    exit_status: Option<i32>,
    closed: bool,
}

impl fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellProcess")
            .field("command", &self.resolved_command.to_string())
            .field("target", &self.target)
            .field("exit_status", &self.exit_status)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ShellProcess {
    /// Resolves the command and spawns it on `target`.
    ///
    /// Process creation honors the parameters' spawn retry policy
    /// (single attempt unless configured otherwise); after the attempts
    /// are exhausted the last spawn error propagates unchanged.
    pub fn spawn(
        target: ExecutionTarget,
        parameters: ShellProcessParameters,
    ) -> Result<Self, ShellError> {
        let resolved_command = parameters.resolve_command();
        debug!(command = %resolved_command, target = %target, "spawning shell process");

        let retry = parameters.spawn_retry().with_default_count(1);
        let mut last: Option<ShellError> = None;
        for attempt in retry.attempts() {
            let spawned = match &target {
                ExecutionTarget::Local => local::spawn(&resolved_command, &parameters),
                ExecutionTarget::Ssh(client) => {
                    remote::spawn(client, &resolved_command, &parameters)
                }
            };
            match spawned {
                Ok(spawned) => {
                    return Ok(Self {
                        parameters,
                        resolved_command,
                        target,
                        handle: spawned.handle,
                        stdin: spawned.stdin,
                        stdout: spawned.stdout,
                        stderr: spawned.stderr,
                        exit_status: None,
                        closed: false,
                    });
                }
                Err(error) => {
                    warn!(
                        command = %resolved_command,
                        attempt = attempt.number(),
                        %error,
                        "process creation failed"
                    );
                    let exhausted = attempt.is_last();
                    last = Some(error);
                    if exhausted {
                        break;
                    }
                    retry.sleep_interval();
                }
            }
        }
        let Some(error) = last else {
            return Err(ShellError::InvalidCommand {
                reason: "spawn retry yielded no attempts".to_owned(),
            });
        };
        Err(error)
    }

    /// The fully wrapped command actually spawned.
    #[must_use]
    pub const fn command(&self) -> &ShellCommand {
        &self.resolved_command
    }

    /// The spawn parameters.
    #[must_use]
    pub const fn parameters(&self) -> &ShellProcessParameters {
        &self.parameters
    }

    /// The backend this process runs on.
    #[must_use]
    pub const fn target(&self) -> &ExecutionTarget {
        &self.target
    }

    /// Everything written to stdin so far.
    #[must_use]
    pub fn stdin_data(&self) -> &[u8] {
        self.stdin.as_ref().map_or(&[], ShellIo::data)
    }

    /// Everything read from stdout so far.
    #[must_use]
    pub fn stdout_data(&self) -> &[u8] {
        self.stdout.as_ref().map_or(&[], ShellIo::data)
    }

    /// Everything read from stderr so far.
    #[must_use]
    pub fn stderr_data(&self) -> &[u8] {
        self.stderr.as_ref().map_or(&[], ShellIo::data)
    }

    /// The exit status, polling the backend while none is cached.
    pub fn exit_status(&mut self) -> Option<i32> {
        if self.exit_status.is_none() {
            self.exit_status = self.handle.poll_exit_status();
            if let Some(status) = self.exit_status {
                debug!(command = %self.resolved_command, status, "process terminated");
            }
        }
        self.exit_status
    }

    /// Returns `true` while no exit status is observable.
    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// Runs read/write rounds until the requested directions are
    /// drained or `timeout` is consumed.
    ///
    /// Pending `stdin_data` is written whenever stdin is write-ready and
    /// stdin is closed once fully flushed (or immediately when there is
    /// nothing to send, so the peer observes EOF). Ready stdout/stderr
    /// chunks are read and captured; a stream is retired once it reports
    /// end of stream. With `receive_all` the loop waits for both output
    /// streams to reach end of stream; without it, a round that finds
    /// nothing ready ends the call once stdin is flushed.
    ///
    /// Reaching the timeout forces a final exit-status check and raises
    /// [`ShellError::Timeout`] rather than spinning forever.
    pub fn communicate(
        &mut self,
        stdin_data: Option<&[u8]>,
        timeout: Option<Duration>,
        receive_all: bool,
    ) -> Result<(), ShellError> {
        let timeout = timeout.unwrap_or_else(|| self.parameters.timeout());
        let poll_interval = self.parameters.poll_interval();
        let mut buffer = vec![0u8; self.parameters.buffer_size()];
        let pending: Vec<u8> = stdin_data.unwrap_or_default().to_vec();
        let mut offset = 0usize;

        if pending.is_empty()
            && let Some(stdin) = &mut self.stdin
        {
            let _ = stdin.close();
        }

        let retry = Retry::new().with_timeout(timeout);
        let mut first_round = true;
        let mut completed = false;
        for attempt in retry.attempts() {
            let mut progressed = false;
            let mut stdin_peer_closed = false;

            // Select and service streams in an inner scope so the
            // mutable stream borrows end before status inspection.
            {
                let mut entries: Vec<(IoInterest, &mut ShellIo)> = Vec::new();
                if offset < pending.len()
                    && let Some(stdin) = self.stdin.as_mut()
                    && !stdin.is_closed()
                {
                    entries.push((IoInterest::Write, stdin));
                }
                if let Some(stdout) = self.stdout.as_mut()
                    && !stdout.is_closed()
                {
                    entries.push((IoInterest::Read, stdout));
                }
                if let Some(stderr) = self.stderr.as_mut()
                    && !stderr.is_closed()
                {
                    entries.push((IoInterest::Read, stderr));
                }
                if entries.is_empty() {
                    completed = true;
                    break;
                }

                let poll_timeout = if first_round {
                    Duration::ZERO
                } else {
                    poll_interval
                };
                first_round = false;

                let ready = select_io(&mut entries, poll_timeout)?;
                for ((interest, stream), is_ready) in entries.iter_mut().zip(&ready) {
                    if !*is_ready {
                        continue;
                    }
                    match interest {
                        IoInterest::Write => match stream.write_chunk(&pending[offset..]) {
                            Ok(0) => {
                                let _ = stream.close();
                                stdin_peer_closed = true;
                            }
                            Ok(written) => {
                                trace!(written, "stdin chunk written");
                                offset += written;
                                progressed = true;
                                if offset >= pending.len() {
                                    let _ = stream.close();
                                }
                            }
                            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                            Err(error) => {
                                trace!(%error, "stdin write failed");
                                let _ = stream.close();
                                stdin_peer_closed = true;
                            }
                        },
                        IoInterest::Read => match stream.read_chunk(&mut buffer) {
                            Ok(0) => {
                                trace!(stream = stream.name(), "stream reached end of stream");
                                let _ = stream.close();
                                progressed = true;
                            }
                            Ok(read) => {
                                trace!(stream = stream.name(), read, "stream chunk read");
                                progressed = true;
                            }
                            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                            Err(error) => {
                                debug!(stream = stream.name(), %error, "stream read failed");
                                let _ = stream.close();
                            }
                        },
                    }
                }
            }

            if stdin_peer_closed && offset < pending.len() {
                return Err(match self.exit_status() {
                    Some(status) => self.terminated_error(Some(status)),
                    None => self.stdin_closed_error(),
                });
            }

            let stdin_active = offset < pending.len()
                && self.stdin.as_ref().is_some_and(|stdin| !stdin.is_closed());
            let output_active = self
                .stdout
                .as_ref()
                .is_some_and(|stdout| !stdout.is_closed())
                || self
                    .stderr
                    .as_ref()
                    .is_some_and(|stderr| !stderr.is_closed());

            if !stdin_active && !output_active {
                completed = true;
                break;
            }
            if !receive_all && !stdin_active && !progressed {
                completed = true;
                break;
            }

            if attempt.check_limits().is_err() {
                break;
            }
        }
        if completed {
            Ok(())
        } else {
            let status = self.exit_status();
            trace!(?status, "communicate timed out");
            Err(self.timeout_error(timeout))
        }
    }

    /// Drains remaining output and waits for the exit status.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<i32, ShellError> {
        let timeout = timeout.unwrap_or_else(|| self.parameters.timeout());
        let started = Instant::now();
        self.communicate(None, Some(timeout), true)?;

        let remaining = timeout
            .saturating_sub(started.elapsed())
            .max(EXIT_STATUS_GRACE);
        let retry = Retry::new()
            .with_timeout(remaining)
            .with_interval(self.parameters.poll_interval());
        for attempt in retry.attempts() {
            if let Some(status) = self.exit_status() {
                return Ok(status);
            }
            if attempt.check_limits().is_err() {
                break;
            }
            retry.sleep_interval();
        }
        Err(self.not_terminated_error())
    }

    /// Waits for completion and verifies the exit status.
    pub fn check_exit_status(&mut self, expected: i32) -> Result<(), ShellError> {
        let status = self.wait(None)?;
        if status == expected {
            Ok(())
        } else {
            Err(self.command_failed_error(status))
        }
    }

    /// Sends a hard termination request.
    pub fn kill(&mut self) -> Result<(), ShellError> {
        debug!(command = %self.resolved_command, "killing shell process");
        self.handle.kill().map_err(ShellError::Io)
    }

    /// Closes stdin, drains remaining output, closes the output
    /// streams, and makes a final exit-status attempt, killing the
    /// process when none is obtainable. Idempotent.
    pub fn close(&mut self) -> Result<(), ShellError> {
        if self.closed {
            return Ok(());
        }
        if let Some(stdin) = &mut self.stdin {
            let _ = stdin.close();
        }
        if self.exit_status.is_none() {
            let _ = self.communicate(None, Some(CLOSE_TIMEOUT), false);
        }
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.close();
        }
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.close();
        }

        if self.exit_status().is_none() {
            let retry = Retry::new()
                .with_timeout(EXIT_STATUS_GRACE)
                .with_interval(self.parameters.poll_interval());
            for attempt in retry.attempts() {
                if self.exit_status().is_some() || attempt.check_limits().is_err() {
                    break;
                }
                retry.sleep_interval();
            }
            if self.exit_status().is_none() {
                warn!(
                    command = %self.resolved_command,
                    "no exit status observed while closing; killing process"
                );
                let _ = self.handle.kill();
                let reap = Retry::new()
                    .with_timeout(Duration::from_millis(500))
                    .with_interval(Duration::from_millis(20));
                for attempt in reap.attempts() {
                    if self.exit_status().is_some() || attempt.check_limits().is_err() {
                        break;
                    }
                    reap.sleep_interval();
                }
            }
        }
        self.closed = true;
        Ok(())
    }

    pub(crate) fn command_failed_error(&self, exit_status: i32) -> ShellError {
        ShellError::CommandFailed {
            command: self.resolved_command.to_string(),
            exit_status,
            stdin: self.captured_stdin(),
            stdout: self.captured_stdout(),
            stderr: self.captured_stderr(),
        }
    }

    fn timeout_error(&self, timeout: Duration) -> ShellError {
        ShellError::Timeout {
            command: self.resolved_command.to_string(),
            timeout,
            stdin: self.captured_stdin(),
            stdout: self.captured_stdout(),
            stderr: self.captured_stderr(),
        }
    }

    fn terminated_error(&self, exit_status: Option<i32>) -> ShellError {
        ShellError::Terminated {
            command: self.resolved_command.to_string(),
            exit_status,
            stdin: self.captured_stdin(),
            stdout: self.captured_stdout(),
            stderr: self.captured_stderr(),
        }
    }

    fn not_terminated_error(&self) -> ShellError {
        ShellError::NotTerminated {
            command: self.resolved_command.to_string(),
            stdin: self.captured_stdin(),
            stdout: self.captured_stdout(),
            stderr: self.captured_stderr(),
        }
    }

    fn stdin_closed_error(&self) -> ShellError {
        ShellError::StdinClosed {
            command: self.resolved_command.to_string(),
            stdin: self.captured_stdin(),
            stdout: self.captured_stdout(),
            stderr: self.captured_stderr(),
        }
    }

    fn captured_stdin(&self) -> String {
        String::from_utf8_lossy(self.stdin_data()).into_owned()
    }

    fn captured_stdout(&self) -> String {
        String::from_utf8_lossy(self.stdout_data()).into_owned()
    }

    fn captured_stderr(&self) -> String {
        String::from_utf8_lossy(self.stderr_data()).into_owned()
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.exit_status().is_none() {
            let _ = self.handle.kill();
        }
        if let Some(stdin) = &mut self.stdin {
            let _ = stdin.close();
        }
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.close();
        }
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.close();
        }
        self.closed = true;
    }
}
