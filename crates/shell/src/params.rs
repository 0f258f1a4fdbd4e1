//! Process spawn parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use stackprobe_retry::Retry;

use crate::command::ShellCommand;

/// Default overall process timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default read/write chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default poll interval of the communicate loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Immutable configuration for one [`ShellProcess`](crate::ShellProcess).
///
/// Unset fields fall back to the crate defaults above. The command is
/// the user's base command; namespace, sudo, and shell wrapping are
/// applied in that fixed order when the process resolves its final
/// command line.
///
/// # Examples
///
/// ```
/// use stackprobe_shell::{ShellCommand, ShellProcessParameters};
///
/// let params = ShellProcessParameters::new(ShellCommand::new(["ping", "-c", "3", "10.0.0.1"]))
///     .with_network_namespace("qdhcp-1234")
///     .with_sudo();
/// assert_eq!(
///     params.resolve_command().to_string(),
///     "sudo ip netns exec qdhcp-1234 ping -c 3 10.0.0.1"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ShellProcessParameters {
    command: ShellCommand,
    environment: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
    stdin: bool,
    stdout: bool,
    stderr: bool,
    buffer_size: usize,
    poll_interval: Duration,
    sudo: bool,
    sudo_user: Option<String>,
    shell: Option<ShellCommand>,
    network_namespace: Option<String>,
    spawn_retry: Retry,
}

impl ShellProcessParameters {
    /// Creates parameters for `command` with default settings: no stdin
    /// pipe, piped stdout/stderr, no wrapping.
    #[must_use]
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            environment: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
            stdin: false,
            stdout: true,
            stderr: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sudo: false,
            sudo_user: None,
            shell: None,
            network_namespace: None,
            spawn_retry: Retry::new(),
        }
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

    /// Replaces the environment mapping.
    #[must_use]
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets the overall process timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables the stdin pipe.
    #[must_use]
    pub const fn with_stdin(mut self, enabled: bool) -> Self {
        self.stdin = enabled;
        self
    }

    /// Enables or disables the stdout pipe.
    #[must_use]
    pub const fn with_stdout(mut self, enabled: bool) -> Self {
        self.stdout = enabled;
        self
    }

    /// Enables or disables the stderr pipe.
    #[must_use]
    pub const fn with_stderr(mut self, enabled: bool) -> Self {
        self.stderr = enabled;
        self
    }

    /// Sets the read/write chunk size.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the communicate loop's poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
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

    /// Wraps the resolved line with a shell invocation, e.g.
    /// `["/bin/sh", "-c"]`.
    #[must_use]
    pub fn with_shell(mut self, shell: ShellCommand) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Wraps the command with `ip netns exec NAMESPACE`.
    #[must_use]
    pub fn with_network_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.network_namespace = Some(namespace.into());
        self
    }

    /// Sets the retry policy applied to process creation.
    #[must_use]
    pub const fn with_spawn_retry(mut self, retry: Retry) -> Self {
        self.spawn_retry = retry;
        self
    }

    /// The base (unwrapped) command.
    #[must_use]
    pub const fn command(&self) -> &ShellCommand {
        &self.command
    }

    /// The environment mapping, in insertion order.
    #[must_use]
    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    /// The working directory, when one was set.
    #[must_use]
    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// The overall process timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a stdin pipe is requested.
    #[must_use]
    pub const fn stdin(&self) -> bool {
        self.stdin
    }

    /// Whether a stdout pipe is requested.
    #[must_use]
    pub const fn stdout(&self) -> bool {
        self.stdout
    }

    /// Whether a stderr pipe is requested.
    #[must_use]
    pub const fn stderr(&self) -> bool {
        self.stderr
    }

    /// The read/write chunk size.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The communicate loop's poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The process creation retry policy.
    #[must_use]
    pub const fn spawn_retry(&self) -> &Retry {
        &self.spawn_retry
    }

    /// Applies, in fixed order, network-namespace wrapping, then sudo
    /// wrapping, then shell wrapping.
    ///
    /// The order matters: sudo must wrap the namespace-entry command,
    /// and the shell wraps the whole sudo+namespace+command line as a
    /// single argument.
    #[must_use]
    pub fn resolve_command(&self) -> ShellCommand {
        let mut command = self.command.clone();
        if let Some(namespace) = &self.network_namespace {
            command = ShellCommand::new(["ip", "netns", "exec", namespace.as_str()]) + command;
        }
        if self.sudo {
            let mut sudo = ShellCommand::new(["sudo"]);
            if let Some(user) = &self.sudo_user {
                sudo = sudo.arg("-u").arg(user);
            }
            command = sudo + command;
        }
        if let Some(shell) = &self.shell {
            command = shell.clone().arg(command.to_string());
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ShellProcessParameters {
        ShellProcessParameters::new(ShellCommand::new(["ovs-vsctl", "show"]))
    }

    #[test]
    fn unwrapped_command_resolves_to_itself() {
        assert_eq!(base().resolve_command().to_string(), "ovs-vsctl show");
    }

    #[test]
    fn namespace_wraps_the_base_command() {
        let params = base().with_network_namespace("qrouter-7");
        assert_eq!(
            params.resolve_command().to_string(),
            "ip netns exec qrouter-7 ovs-vsctl show"
        );
    }

    #[test]
    fn sudo_wraps_the_namespace_entry_command() {
        let params = base().with_network_namespace("qrouter-7").with_sudo();
        assert_eq!(
            params.resolve_command().to_string(),
            "sudo ip netns exec qrouter-7 ovs-vsctl show"
        );
    }

    #[test]
    fn sudo_user_is_passed_through() {
        let params = base().with_sudo_user("stack");
        assert_eq!(
            params.resolve_command().to_string(),
            "sudo -u stack ovs-vsctl show"
        );
    }

    #[test]
    fn shell_wraps_the_whole_line_as_one_argument() {
        let params = base()
            .with_network_namespace("qrouter-7")
            .with_sudo()
            .with_shell(ShellCommand::new(["/bin/sh", "-c"]));
        let resolved = params.resolve_command();
        assert_eq!(
            resolved.arguments(),
            [
                "/bin/sh",
                "-c",
                "sudo ip netns exec qrouter-7 ovs-vsctl show"
            ]
        );
    }

    #[test]
    fn defaults_disable_stdin_and_enable_output_capture() {
        let params = base();
        assert!(!params.stdin());
        assert!(params.stdout());
        assert!(params.stderr());
        assert_eq!(params.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(params.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(params.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn environment_preserves_insertion_order() {
        let params = base()
            .with_environment_variable("OS_CLOUD", "overcloud")
            .with_environment_variable("OS_REGION", "regionOne");
        let keys: Vec<&str> = params
            .environment()
            .iter()
            .map(|(key, _)| key.as_str())
            .collect();
        assert_eq!(keys, ["OS_CLOUD", "OS_REGION"]);
    }
}
