//! SSH channel backend.
//!
//! Runs the resolved command through an `exec` request on a session
//! channel obtained from [`SshClient::open_session_channel`] (which owns
//! the reconnect-and-retry policy for transient channel failures). The
//! channel's stdin/stdout/stderr halves are adapted to the
//! [`RawStream`] interface over the session in non-blocking mode.
//!
//! Channel buffers are invisible to a kernel-level wait, so the read
//! probe drains the channel opportunistically into a pending buffer; the
//! session's socket descriptor is still exposed for the blocking wait
//! phase, where inbound transport data wakes the poll.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ssh2::Channel;
use stackprobe_ssh::SshClient;
use tracing::trace;

use crate::command::{ShellCommand, quote_argument};
use crate::error::ShellError;
use crate::io::{RawStream, ShellIo, poll_single};
use crate::params::ShellProcessParameters;
use crate::process::{ProcessHandle, SpawnedProcess};

/// Spawns `command` on the remote side of `client`.
pub(crate) fn spawn(
    client: &Arc<SshClient>,
    command: &ShellCommand,
    parameters: &ShellProcessParameters,
) -> Result<SpawnedProcess, ShellError> {
    let ssh_channel = client.open_session_channel()?;
    let socket_fd = ssh_channel.socket_fd;
    let mut channel = ssh_channel.channel;

    let line = remote_command_line(command, parameters);
    trace!(login = %client.login(), command = %line, "sending exec request");
    channel
        .exec(&line)
        .map_err(|error| ShellError::Spawn {
            command: line.clone(),
            source: error.into(),
        })?;
    client.set_blocking(false);

    let channel = Arc::new(Mutex::new(channel));
    let stdin = parameters.stdin().then(|| {
        ShellIo::new(
            "stdin",
            Box::new(ChannelStream::new(
                Arc::clone(&channel),
                ChannelHalf::Stdin,
                socket_fd,
            )) as Box<dyn RawStream>,
        )
    });
    let stdout = parameters.stdout().then(|| {
        ShellIo::new(
            "stdout",
            Box::new(ChannelStream::new(
                Arc::clone(&channel),
                ChannelHalf::Stdout,
                socket_fd,
            )) as Box<dyn RawStream>,
        )
    });
    let stderr = parameters.stderr().then(|| {
        ShellIo::new(
            "stderr",
            Box::new(ChannelStream::new(
                Arc::clone(&channel),
                ChannelHalf::Stderr,
                socket_fd,
            )) as Box<dyn RawStream>,
        )
    });

    Ok(SpawnedProcess {
        handle: Box::new(SshProcessHandle { channel }),
        stdin,
        stdout,
        stderr,
    })
}

/// Builds the remote command line.
///
/// sshd rarely permits arbitrary names through `setenv`, so the
/// environment is carried as an `env KEY=VALUE` prefix; a working
/// directory becomes a `cd`-and-exec shell wrapper around the line.
pub(crate) fn remote_command_line(
    command: &ShellCommand,
    parameters: &ShellProcessParameters,
) -> String {
    let mut command = command.clone();
    if !parameters.environment().is_empty() {
        let mut prefix = ShellCommand::new(["env"]);
        for (key, value) in parameters.environment() {
            prefix = prefix.arg(format!("{key}={value}"));
        }
        command = prefix + command;
    }
    match parameters.current_dir() {
        Some(dir) => format!(
            "cd {} && {}",
            quote_argument(&dir.to_string_lossy()),
            command
        ),
        None => command.to_string(),
    }
}

/// Which half of the channel a stream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelHalf {
    Stdin,
    Stdout,
    Stderr,
}

/// One half of a non-blocking SSH channel.
struct ChannelStream {
    channel: Arc<Mutex<Channel>>,
    half: ChannelHalf,
    socket_fd: RawFd,
    pending: Vec<u8>,
    reached_eof: bool,
    write_blocked: bool,
    closed: bool,
}

impl ChannelStream {
    fn new(channel: Arc<Mutex<Channel>>, half: ChannelHalf, socket_fd: RawFd) -> Self {
        Self {
            channel,
            half,
            socket_fd,
            pending: Vec::new(),
            reached_eof: false,
            write_blocked: false,
            closed: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drains currently buffered channel data into `pending`.
    fn fill_pending(&mut self) {
        if self.reached_eof || !self.pending.is_empty() {
            return;
        }
        let mut buf = [0u8; 8 * 1024];
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match self.half {
            ChannelHalf::Stdout => channel.read(&mut buf),
            ChannelHalf::Stderr => channel.stderr().read(&mut buf),
            ChannelHalf::Stdin => return,
        };
        match result {
            Ok(0) => self.reached_eof = true,
            Ok(read) => self.pending.extend_from_slice(&buf[..read]),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                if channel.eof() {
                    self.reached_eof = true;
                }
            }
            Err(error) => {
                trace!(%error, "channel read probe failed");
                self.reached_eof = true;
            }
        }
    }
}

impl RawStream for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill_pending();
        if !self.pending.is_empty() {
            let take = buf.len().min(self.pending.len());
            buf[..take].copy_from_slice(&self.pending[..take]);
            self.pending.drain(..take);
            return Ok(take);
        }
        if self.reached_eof {
            return Ok(0);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        match channel.write(buf) {
            Ok(written) => {
                self.write_blocked = false;
                Ok(written)
            }
            Err(error) => {
                if error.kind() == io::ErrorKind::WouldBlock {
                    self.write_blocked = true;
                }
                Err(error)
            }
        }
    }

    fn read_ready(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.fill_pending();
        !self.pending.is_empty() || self.reached_eof
    }

    fn write_ready(&mut self) -> bool {
        // libssh2 exposes no cheap send-window probe. An open half is
        // treated as writable until a write reports backpressure, after
        // which transport-level writability gates the next attempt.
        if self.closed {
            return false;
        }
        !self.write_blocked || poll_single(self.socket_fd, libc::POLLOUT)
    }

    fn poll_fd(&self) -> Option<RawFd> {
        if self.closed {
            None
        } else {
            Some(self.socket_fd)
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.half == ChannelHalf::Stdin {
            // Half-close so the remote process observes EOF on its stdin.
            let mut channel = self.lock();
            if let Err(error) = channel.send_eof() {
                let error: io::Error = error.into();
                if error.kind() != io::ErrorKind::WouldBlock {
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}

/// Lifecycle handle over the shared channel.
struct SshProcessHandle {
    channel: Arc<Mutex<Channel>>,
}

impl SshProcessHandle {
    fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessHandle for SshProcessHandle {
    fn poll_exit_status(&mut self) -> Option<i32> {
        let mut channel = self.lock();
        if !channel.eof() {
            return None;
        }
        let _ = channel.close();
        match channel.wait_close() {
            Ok(()) => channel.exit_status().ok(),
            Err(error) => {
                let error: io::Error = error.into();
                if error.kind() == io::ErrorKind::WouldBlock {
                    None
                } else {
                    channel.exit_status().ok()
                }
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        // The SSH exec protocol has no reliable remote-signal delivery;
        // tearing the channel down is the termination request.
        let mut channel = self.lock();
        match channel.close() {
            Ok(()) => Ok(()),
            Err(error) => {
                let error: io::Error = error.into();
                if error.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(command: &[&str]) -> ShellProcessParameters {
        ShellProcessParameters::new(ShellCommand::new(command.to_vec()))
    }

    #[test]
    fn plain_commands_render_unchanged() {
        let command = ShellCommand::new(["systemctl", "is-active", "openvswitch"]);
        let line = remote_command_line(&command, &parameters(&[]));
        assert_eq!(line, "systemctl is-active openvswitch");
    }

    #[test]
    fn environment_becomes_an_env_prefix() {
        let command = ShellCommand::new(["nova-manage", "cell_v2", "list_cells"]);
        let params = parameters(&[])
            .with_environment_variable("OS_CLOUD", "overcloud")
            .with_environment_variable("GREETING", "hello world");
        let line = remote_command_line(&command, &params);
        assert_eq!(
            line,
            "env OS_CLOUD=overcloud 'GREETING=hello world' nova-manage cell_v2 list_cells"
        );
    }

    #[test]
    fn working_directory_becomes_a_cd_wrapper() {
        let command = ShellCommand::new(["ls"]);
        let params = parameters(&[]).with_current_dir("/var/log/containers");
        let line = remote_command_line(&command, &params);
        assert_eq!(line, "cd /var/log/containers && ls");
    }

    #[test]
    fn working_directory_with_spaces_is_quoted() {
        let command = ShellCommand::new(["ls"]);
        let params = parameters(&[]).with_current_dir("/tmp/test dir");
        let line = remote_command_line(&command, &params);
        assert_eq!(line, "cd '/tmp/test dir' && ls");
    }
}
