//! Unified shell execution error taxonomy.
//!
//! Every process-level failure carries the rendered command line plus the
//! stdin/stdout/stderr content captured up to the point of failure, so a
//! failed remote command can be diagnosed without re-running it
//! interactively.

use std::io;
use std::time::Duration;

use stackprobe_ssh::SshError;
use thiserror::Error;

/// Errors produced while spawning and driving shell processes.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A command line could not be parsed into arguments.
    #[error("invalid command line: {reason}")]
    InvalidCommand {
        /// Description of the parse failure.
        reason: String,
    },

    /// The process could not be spawned at all.
    #[error("failed to spawn command `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying spawn failure.
        #[source]
        source: io::Error,
    },

    /// The process exited with an unexpected status.
    #[error(
        "command `{command}` failed with exit status {exit_status}\n\
         stdin:\n{stdin}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Observed exit status.
        exit_status: i32,
        /// Captured stdin content.
        stdin: String,
        /// Captured stdout content.
        stdout: String,
        /// Captured stderr content.
        stderr: String,
    },

    /// The process did not finish within the allotted time.
    #[error(
        "command `{command}` timed out after {:.1}s\n\
         stdin:\n{stdin}\nstdout:\n{stdout}\nstderr:\n{stderr}",
        timeout.as_secs_f64()
    )]
    Timeout {
        /// Rendered command line.
        command: String,
        /// Timeout that was exceeded.
        timeout: Duration,
        /// Captured stdin content.
        stdin: String,
        /// Captured stdout content.
        stdout: String,
        /// Captured stderr content.
        stderr: String,
    },

    /// The process died while communication was still in progress.
    #[error(
        "command `{command}` terminated unexpectedly (exit status {exit_status:?})\n\
         stdin:\n{stdin}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    Terminated {
        /// Rendered command line.
        command: String,
        /// Exit status, when one was observable.
        exit_status: Option<i32>,
        /// Captured stdin content.
        stdin: String,
        /// Captured stdout content.
        stdout: String,
        /// Captured stderr content.
        stderr: String,
    },

    /// No exit status became observable within the allotted time.
    #[error(
        "command `{command}` did not terminate\n\
         stdin:\n{stdin}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    NotTerminated {
        /// Rendered command line.
        command: String,
        /// Captured stdin content.
        stdin: String,
        /// Captured stdout content.
        stdout: String,
        /// Captured stderr content.
        stderr: String,
    },

    /// The peer closed stdin while data was still pending.
    #[error(
        "stdin of command `{command}` closed by peer with data pending\n\
         stdin:\n{stdin}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    StdinClosed {
        /// Rendered command line.
        command: String,
        /// Captured stdin content.
        stdin: String,
        /// Captured stdout content.
        stdout: String,
        /// Captured stderr content.
        stderr: String,
    },

    /// Failure in the SSH connection layer.
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// Uncategorized I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShellError {
    /// Returns the exit status carried by the error, when there is one.
    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_status, .. } => Some(*exit_status),
            Self::Terminated { exit_status, .. } => *exit_status,
            _ => None,
        }
    }

    /// Returns `true` for the timeout variant.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_exposes_its_exit_status() {
        let error = ShellError::CommandFailed {
            command: "false".to_owned(),
            exit_status: 1,
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(error.exit_status(), Some(1));
        assert!(!error.is_timeout());
    }

    #[test]
    fn display_includes_command_and_captured_streams() {
        let error = ShellError::CommandFailed {
            command: "systemctl restart nova-compute".to_owned(),
            exit_status: 5,
            stdin: String::new(),
            stdout: "inactive".to_owned(),
            stderr: "unit not found".to_owned(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("systemctl restart nova-compute"));
        assert!(rendered.contains("exit status 5"));
        assert!(rendered.contains("inactive"));
        assert!(rendered.contains("unit not found"));
    }

    #[test]
    fn timeout_is_distinguished_from_command_failure() {
        let error = ShellError::Timeout {
            command: "sleep 5".to_owned(),
            timeout: Duration::from_secs(1),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(error.is_timeout());
        assert_eq!(error.exit_status(), None);
    }
}
