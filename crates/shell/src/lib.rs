#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `stackprobe-shell` runs commands for the stackprobe harness, on the
//! local machine or over SSH, behind one uniform interface. It is the
//! piece the health checks lean on when they kill an agent, restart a
//! service, or reboot a node and then need to observe what actually
//! happened, so its job is mostly careful plumbing: draining
//! stdin/stdout/stderr without deadlocks, bounding every wait, and
//! attaching full captured output to every failure.
//!
//! # Architecture
//!
//! - [`ShellCommand`]: immutable ordered argument vector with shell
//!   quoting and `+` concatenation.
//! - [`ShellIo`] / [`select_io`]: stream handles that remember every
//!   chunk and a two-phase readiness partition (per-stream probes first,
//!   then one blocking `poll(2)`); SSH channel buffers are invisible to
//!   the kernel, which is why the probe phase exists.
//! - [`ShellProcess`]: the lifecycle state machine, written once against
//!   the [`RawStream`] and [`ProcessHandle`] capability interfaces; the
//!   backend is picked once at construction via [`ExecutionTarget`].
//! - [`execute`] / [`local_execute`] / [`ssh_execute`]: the synchronous
//!   convenience layer used by practically every health check.
//! - [`ShellConnectionManager`]: one reusable connection record per
//!   logical target.
//!
//! # Concurrency model
//!
//! Single-threaded and cooperative: one call stack services a process's
//! stdin, stdout, and stderr through readiness polling. Blocking reads
//! and writes run only after a readiness check, and every loop is
//! bounded by a `stackprobe_retry` budget, so a wedged remote command
//! surfaces as a typed timeout instead of a hung harness.
//!
//! # Examples
//!
//! ```
//! use stackprobe_shell::{ExecuteOptions, execute};
//!
//! let result = execute("exit 3", &ExecuteOptions::new().without_check()).unwrap();
//! assert_eq!(result.exit_status, 3);
//! ```

mod command;
mod connection;
mod error;
mod execute;
mod io;
mod local;
mod params;
mod process;
mod remote;

pub use command::ShellCommand;
pub use connection::{ShellConnection, ShellConnectionManager};
pub use error::ShellError;
pub use execute::{ExecuteOptions, ExecuteResult, execute, execute_command, local_execute, ssh_execute};
pub use io::{IoInterest, RawStream, ShellIo, select_io};
pub use params::{
    DEFAULT_BUFFER_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT, ShellProcessParameters,
};
pub use process::{ExecutionTarget, ProcessHandle, ShellProcess};
