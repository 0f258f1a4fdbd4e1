//! Synchronous execution façade.
//!
//! [`execute`] spawns a process for a command line, optionally feeds it
//! stdin, waits for completion, and, unless checking is disabled,
//! raises [`ShellError::CommandFailed`] on an unexpected exit status.
//! The backend comes from [`ExecuteOptions::target`];
//! [`local_execute`] and [`ssh_execute`] force it explicitly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stackprobe_ssh::SshClient;

use crate::command::ShellCommand;
use crate::error::ShellError;
use crate::params::ShellProcessParameters;
use crate::process::{ExecutionTarget, ShellProcess};

/// Options accepted by [`execute`].
///
/// The default wraps the command with `/bin/sh -c` (so shell syntax
/// such as `exit 3` behaves as written), captures stdout and stderr,
/// and checks for exit status 0.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    target: ExecutionTarget,
    environment: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    check: bool,
    expected_exit_status: i32,
    stdin_data: Option<Vec<u8>>,
    stdout: bool,
    stderr: bool,
    sudo: bool,
    sudo_user: Option<String>,
    shell: Option<ShellCommand>,
    network_namespace: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            target: ExecutionTarget::Local,
            environment: Vec::new(),
            current_dir: None,
            timeout: None,
            check: true,
            expected_exit_status: 0,
            stdin_data: None,
            stdout: true,
            stderr: true,
            sudo: false,
            sudo_user: None,
            shell: Some(ShellCommand::new(["/bin/sh", "-c"])),
            network_namespace: None,
        }
    }
}

impl ExecuteOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution backend.
    #[must_use]
    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    /// Runs the command over the given SSH client.
    #[must_use]
    pub fn with_ssh_client(mut self, client: Arc<SshClient>) -> Self {
        self.target = ExecutionTarget::Ssh(client);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_environment_variable(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables exit-status checking.
    #[must_use]
    pub const fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Disables exit-status checking.
    #[must_use]
    pub const fn without_check(self) -> Self {
        self.with_check(false)
    }

    /// Sets the exit status treated as success when checking.
    #[must_use]
    pub const fn with_expected_exit_status(mut self, status: i32) -> Self {
        self.expected_exit_status = status;
        self
    }

    /// Sends `data` to the process's stdin (and enables the stdin pipe).
    #[must_use]
    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Enables or disables stdout capture.
    #[must_use]
    pub const fn with_stdout(mut self, enabled: bool) -> Self {
        self.stdout = enabled;
        self
    }

    /// Enables or disables stderr capture.
    #[must_use]
    pub const fn with_stderr(mut self, enabled: bool) -> Self {
        self.stderr = enabled;
        self
    }

    /// Wraps the command with `sudo`.
    #[must_use]
    pub const fn with_sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Wraps the command with `sudo -u USER`.
    #[must_use]
    pub fn with_sudo_user(mut self, user: impl Into<String>) -> Self {
        self.sudo = true;
        self.sudo_user = Some(user.into());
        self
    }

    /// Replaces the shell wrapper (default `/bin/sh -c`).
    #[must_use]
    pub fn with_shell(mut self, shell: ShellCommand) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Runs the argument vector directly, without a shell.
    #[must_use]
    pub fn without_shell(mut self) -> Self {
        self.shell = None;
        self
    }

    /// Wraps the command with `ip netns exec NAMESPACE`.
    #[must_use]
    pub fn with_network_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.network_namespace = Some(namespace.into());
        self
    }

    fn build_parameters(&self, command: ShellCommand) -> ShellProcessParameters {
        let mut parameters = ShellProcessParameters::new(command)
            .with_environment(self.environment.clone())
            .with_stdin(self.stdin_data.is_some())
            .with_stdout(self.stdout)
            .with_stderr(self.stderr);
        if let Some(timeout) = self.timeout {
            parameters = parameters.with_timeout(timeout);
        }
        if let Some(dir) = &self.current_dir {
            parameters = parameters.with_current_dir(dir);
        }
        if let Some(user) = &self.sudo_user {
            parameters = parameters.with_sudo_user(user.clone());
        } else if self.sudo {
            parameters = parameters.with_sudo();
        }
        if let Some(namespace) = &self.network_namespace {
            parameters = parameters.with_network_namespace(namespace.clone());
        }
        parameters
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Rendered command line that was spawned.
    pub command: String,
    /// Observed exit status.
    pub exit_status: i32,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

/// Executes the command line `command` under `options`.
///
/// With a shell wrapper configured (the default), the line is handed to
/// the shell verbatim as its `-c` argument, so shell syntax (`exit 3`,
/// pipelines, loops, expansions) behaves exactly as written. Without a
/// shell the line is split into an argument vector with shell-style
/// quoting and spawned directly.
///
/// # Examples
///
/// ```
/// use stackprobe_shell::{ExecuteOptions, execute};
///
/// let result = execute("echo hello", &ExecuteOptions::new()).unwrap();
/// assert_eq!(result.stdout.trim(), "hello");
/// assert_eq!(result.exit_status, 0);
/// ```
pub fn execute(command: &str, options: &ExecuteOptions) -> Result<ExecuteResult, ShellError> {
    let command = match &options.shell {
        Some(shell) => shell.clone().arg(command),
        None => ShellCommand::parse(command)?,
    };
    execute_prepared(command, options)
}

/// Executes an already-built argument vector under `options`.
///
/// The options' shell wrapper is applied around the rendered vector (via
/// [`ShellProcessParameters`] resolution), preserving each argument.
pub fn execute_command(
    command: &ShellCommand,
    options: &ExecuteOptions,
) -> Result<ExecuteResult, ShellError> {
    let command = match &options.shell {
        Some(shell) => shell.clone().arg(command.to_string()),
        None => command.clone(),
    };
    execute_prepared(command, options)
}

fn execute_prepared(
    command: ShellCommand,
    options: &ExecuteOptions,
) -> Result<ExecuteResult, ShellError> {
    let parameters = options.build_parameters(command);
    let mut process = ShellProcess::spawn(options.target.clone(), parameters)?;

    let outcome = run_to_completion(&mut process, options);
    let _ = process.close();
    let exit_status = outcome?;

    if options.check && exit_status != options.expected_exit_status {
        return Err(process.command_failed_error(exit_status));
    }
    Ok(ExecuteResult {
        command: process.command().to_string(),
        exit_status,
        stdout: String::from_utf8_lossy(process.stdout_data()).into_owned(),
        stderr: String::from_utf8_lossy(process.stderr_data()).into_owned(),
    })
}

/// Executes on the local backend regardless of the options' target.
pub fn local_execute(
    command: &str,
    options: &ExecuteOptions,
) -> Result<ExecuteResult, ShellError> {
    execute(command, &options.clone().with_target(ExecutionTarget::Local))
}

/// Executes over `client` regardless of the options' target.
pub fn ssh_execute(
    client: Arc<SshClient>,
    command: &str,
    options: &ExecuteOptions,
) -> Result<ExecuteResult, ShellError> {
    execute(command, &options.clone().with_ssh_client(client))
}

fn run_to_completion(
    process: &mut ShellProcess,
    options: &ExecuteOptions,
) -> Result<i32, ShellError> {
    process.communicate(options.stdin_data.as_deref(), options.timeout, true)?;
    process.wait(options.timeout)
}
