//! Unified SSH error taxonomy.
//!
//! Backend-specific failures (`std::io`, `ssh2`) are caught close to the
//! source and re-raised as one of the variants below, so retry loops and
//! callers only ever observe the unified set. Transient conditions are
//! retried internally by the connection layer; everything surfaced here
//! either exhausted its retry budget or was never retryable.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the SSH connection layer.
#[derive(Debug, Error)]
pub enum SshError {
    /// Connection parameters failed validation before any socket work.
    ///
    /// Never retried: a bad port or a non-positive timeout will not get
    /// better on a second attempt.
    #[error("invalid SSH connection parameters: {reason}")]
    InvalidParameters {
        /// Human-readable description of the rejected parameter.
        reason: String,
    },

    /// An SSH configuration file could not be parsed.
    #[error("invalid SSH configuration (line {line}): {reason}")]
    Config {
        /// 1-based line number of the offending directive.
        line: usize,
        /// Description of the problem.
        reason: String,
    },

    /// Connection establishment failed after the bounded attempt budget.
    ///
    /// Carries the last underlying error unchanged so callers can still
    /// distinguish a refused connection from a handshake timeout.
    #[error("failed to connect to {login}: {source}")]
    Connect {
        /// `user@host:port` rendering of the target.
        login: String,
        /// Last error observed before giving up.
        #[source]
        source: io::Error,
    },

    /// Authentication was rejected for every configured method.
    #[error("SSH authentication failed for {login}: {reason}")]
    Auth {
        /// `user@host:port` rendering of the target.
        login: String,
        /// Summary of the attempted methods.
        reason: String,
    },

    /// Opening a session channel failed after the channel retry budget.
    #[error("failed to open SSH channel on {login}: {source}")]
    ChannelOpen {
        /// `user@host:port` rendering of the target.
        login: String,
        /// Last error observed before giving up.
        #[source]
        source: ssh2::Error,
    },

    /// An SSH operation hit a transport-level timeout.
    ///
    /// Raised without retry: a timed-out channel request means the
    /// connection itself is gone, and reconnect-and-retry belongs to the
    /// caller's (bounded) policy, not this layer's.
    #[error("SSH operation timed out on {login} after {:.1}s", timeout.as_secs_f64())]
    Timeout {
        /// `user@host:port` rendering of the target.
        login: String,
        /// Timeout that was exceeded.
        timeout: Duration,
    },

    /// Uncategorized libssh2 failure.
    #[error(transparent)]
    Ssh2(#[from] ssh2::Error),

    /// Uncategorized I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SshError {
    /// Returns `true` when the connection layer may retry the operation.
    ///
    /// Only establishment failures qualify; validation, authentication,
    /// and timeout errors propagate immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

// libssh2 result codes that need special-casing. The `ssh2` crate exposes
// them only as raw session error codes.
pub(crate) const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
pub(crate) const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;

/// Returns `true` when `error` is a transport-level timeout.
pub(crate) fn is_timeout_error(error: &ssh2::Error) -> bool {
    matches!(
        error.code(),
        ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_are_retryable() {
        let error = SshError::Connect {
            login: "probe@host:22".to_owned(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(error.is_retryable());
    }

    #[test]
    fn validation_and_timeout_errors_are_not_retryable() {
        let invalid = SshError::InvalidParameters {
            reason: "port must not be zero".to_owned(),
        };
        assert!(!invalid.is_retryable());

        let timeout = SshError::Timeout {
            login: "probe@host:22".to_owned(),
            timeout: Duration::from_secs(10),
        };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn display_carries_the_login() {
        let error = SshError::Auth {
            login: "probe@controller-0:22".to_owned(),
            reason: "no method succeeded".to_owned(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("probe@controller-0:22"));
        assert!(rendered.contains("no method succeeded"));
    }
}
