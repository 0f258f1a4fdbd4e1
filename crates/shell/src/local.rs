#![allow(unsafe_code)]

//! Local subprocess backend.
//!
//! Spawns the resolved command as an OS child process with piped stdio,
//! switches each pipe end to non-blocking mode, and adapts the handles
//! to the [`RawStream`]/[`ProcessHandle`] capability interfaces the
//! process state machine is written against.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::trace;

use crate::command::ShellCommand;
use crate::error::ShellError;
use crate::io::{RawStream, ShellIo, poll_single};
use crate::params::ShellProcessParameters;
use crate::process::{ProcessHandle, SpawnedProcess};

/// Spawns `command` locally under `parameters`.
pub(crate) fn spawn(
    command: &ShellCommand,
    parameters: &ShellProcessParameters,
) -> Result<SpawnedProcess, ShellError> {
    let Some(program) = command.program() else {
        return Err(ShellError::InvalidCommand {
            reason: "cannot spawn an empty command".to_owned(),
        });
    };

    let mut builder = Command::new(program);
    builder.args(&command.arguments()[1..]);
    builder.stdin(stdio_for(parameters.stdin()));
    builder.stdout(stdio_for(parameters.stdout()));
    builder.stderr(stdio_for(parameters.stderr()));
    if let Some(dir) = parameters.current_dir() {
        builder.current_dir(dir);
    }
    for (key, value) in parameters.environment() {
        builder.env(key, value);
    }

    let mut child = builder.spawn().map_err(|source| ShellError::Spawn {
        command: command.to_string(),
        source,
    })?;
    trace!(pid = child.id(), command = %command, "local process spawned");

    let stdin = match child.stdin.take() {
        Some(pipe) => Some(ShellIo::new(
            "stdin",
            Box::new(PipeStream::new(OwnedFd::from(pipe))?),
        )),
        None => None,
    };
    let stdout = match child.stdout.take() {
        Some(pipe) => Some(ShellIo::new(
            "stdout",
            Box::new(PipeStream::new(OwnedFd::from(pipe))?),
        )),
        None => None,
    };
    let stderr = match child.stderr.take() {
        Some(pipe) => Some(ShellIo::new(
            "stderr",
            Box::new(PipeStream::new(OwnedFd::from(pipe))?),
        )),
        None => None,
    };

    Ok(SpawnedProcess {
        handle: Box::new(LocalProcessHandle { child }),
        stdin,
        stdout,
        stderr,
    })
}

fn stdio_for(enabled: bool) -> Stdio {
    if enabled { Stdio::piped() } else { Stdio::null() }
}

/// One end of an OS pipe in non-blocking mode.
///
/// Readiness probes go through a zero-timeout `poll(2)`; hangup counts
/// as readable so end of stream is observed promptly.
pub(crate) struct PipeStream {
    file: Option<File>,
    fd: RawFd,
}

impl PipeStream {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let raw = fd.as_raw_fd();
        Ok(Self {
            file: Some(File::from(fd)),
            fd: raw,
        })
    }
}

impl RawStream for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write(buf),
            None => Ok(0),
        }
    }

    fn read_ready(&mut self) -> bool {
        self.file.is_some() && poll_single(self.fd, libc::POLLIN)
    }

    fn write_ready(&mut self) -> bool {
        self.file.is_some() && poll_single(self.fd, libc::POLLOUT)
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|_| self.fd)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct LocalProcessHandle {
    child: Child,
}

impl ProcessHandle for LocalProcessHandle {
    fn poll_exit_status(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code(status)),
            Ok(None) => None,
            Err(error) => {
                trace!(%error, "exit status poll failed");
                None
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(error) if error.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(error) => Err(error),
        }
    }
}

/// Signal deaths map to the conventional `128 + signal` statuses.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parameters(command: &str) -> ShellProcessParameters {
        ShellProcessParameters::new(ShellCommand::parse(command).expect("parse"))
    }

    #[test]
    fn spawning_an_empty_command_is_rejected() {
        let error = spawn(&ShellCommand::default(), &parameters("true"))
            .expect_err("empty command");
        assert!(matches!(error, ShellError::InvalidCommand { .. }));
    }

    #[test]
    fn spawning_a_missing_program_reports_spawn_failure() {
        let command = ShellCommand::new(["/nonexistent/stackprobe-binary"]);
        let error = spawn(&command, &parameters("true")).expect_err("missing binary");
        assert!(matches!(error, ShellError::Spawn { .. }));
    }

    #[test]
    fn exit_status_becomes_observable_after_termination() {
        let command = ShellCommand::new(["true"]);
        let mut spawned = spawn(&command, &parameters("true")).expect("spawn");
        let mut status = None;
        for _ in 0..100 {
            status = spawned.handle.poll_exit_status();
            if status.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(status, Some(0));
    }

    #[test]
    fn kill_terminates_a_running_process() {
        let command = ShellCommand::new(["sleep", "60"]);
        let mut spawned = spawn(&command, &parameters("sleep 60")).expect("spawn");
        assert_eq!(spawned.handle.poll_exit_status(), None);
        spawned.handle.kill().expect("kill");
        let mut status = None;
        for _ in 0..100 {
            status = spawned.handle.poll_exit_status();
            if status.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        // SIGKILL deaths surface as 128 + 9.
        assert_eq!(status, Some(137));
    }

    #[test]
    fn kill_after_exit_is_harmless() {
        let command = ShellCommand::new(["true"]);
        let mut spawned = spawn(&command, &parameters("true")).expect("spawn");
        while spawned.handle.poll_exit_status().is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        spawned.handle.kill().expect("kill after exit");
    }

    #[test]
    fn disabled_streams_are_absent() {
        let command = ShellCommand::new(["true"]);
        let params = parameters("true");
        let spawned = spawn(&command, &params).expect("spawn");
        assert!(spawned.stdin.is_none());
        assert!(spawned.stdout.is_some());
        assert!(spawned.stderr.is_some());
    }
}
