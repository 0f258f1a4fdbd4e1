//! SSH host configuration resolution.
//!
//! Host settings come from three layers, strongest first: explicit
//! [`SshConnectParameters`] supplied by the caller, values looked up in an
//! `~/.ssh/config`-style file, and built-in defaults. Lookup follows
//! OpenSSH semantics: blocks are scanned in file order and the first
//! obtained value wins per option, except `IdentityFile` which
//! accumulates. Unsupported directives (`Include`, `Match`, ...) are
//! skipped with a warning instead of failing the whole file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::SshError;

/// Default SSH port when neither parameters nor configuration name one.
pub const DEFAULT_PORT: u16 = 22;

/// Default per-attempt connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of connection attempts.
pub const DEFAULT_CONNECTION_ATTEMPTS: usize = 3;

/// Default spacing between connection attempts.
pub const DEFAULT_CONNECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration keywords this resolver understands.
const SUPPORTED_KEYWORDS: &[&str] = &[
    "host",
    "hostname",
    "port",
    "user",
    "proxyjump",
    "proxycommand",
    "identityfile",
    "forwardagent",
    "compression",
    "connecttimeout",
];

/// One `Host` block: the patterns it applies to and its directives in
/// file order.
#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, host: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if pattern_matches(negated, host) {
                    return false;
                }
            } else if pattern_matches(pattern, host) {
                matched = true;
            }
        }
        matched
    }
}

/// Parsed `~/.ssh/config`-style content.
///
/// Parsing is tolerant: unknown keywords are warned about and ignored so
/// a config written for a newer OpenSSH still resolves.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// Returns an empty configuration: every lookup falls through to
    /// parameters and defaults.
    #[must_use]
    pub const fn empty() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self, SshError> {
        let mut blocks = Vec::new();
        // Options appearing before any Host block apply to every host.
        let mut current = HostBlock {
            patterns: vec!["*".to_owned()],
            options: Vec::new(),
        };

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((keyword, value)) = split_directive(line) else {
                return Err(SshError::Config {
                    line: index + 1,
                    reason: format!("directive without a value: {line:?}"),
                });
            };
            let keyword = keyword.to_ascii_lowercase();

            if keyword == "host" {
                if !current.options.is_empty() {
                    blocks.push(current);
                }
                current = HostBlock {
                    patterns: value.split_whitespace().map(str::to_owned).collect(),
                    options: Vec::new(),
                };
                if current.patterns.is_empty() {
                    return Err(SshError::Config {
                        line: index + 1,
                        reason: "Host directive without patterns".to_owned(),
                    });
                }
                continue;
            }

            if !SUPPORTED_KEYWORDS.contains(&keyword.as_str()) {
                warn!(
                    keyword = %keyword,
                    line = index + 1,
                    "ignoring unsupported SSH config directive"
                );
                continue;
            }
            current.options.push((keyword, value.to_owned()));
        }
        if !current.options.is_empty() {
            blocks.push(current);
        }

        Ok(Self { blocks })
    }

    /// Loads and parses a configuration file.
    ///
    /// A missing file resolves to the empty configuration; anything else
    /// that prevents reading is surfaced as an error.
    pub fn load(path: &Path) -> Result<Self, SshError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(error) => Err(SshError::Io(error)),
        }
    }

    /// Loads the current user's `~/.ssh/config`, when present.
    pub fn load_user_config() -> Result<Self, SshError> {
        match env::var_os("HOME") {
            Some(home) => Self::load(&PathBuf::from(home).join(".ssh").join("config")),
            None => Ok(Self::empty()),
        }
    }

    /// Returns the first obtained value for `keyword` when connecting to
    /// `host` (lowercased keyword, OpenSSH first-match-wins semantics).
    #[must_use]
    pub fn lookup(&self, host: &str, keyword: &str) -> Option<&str> {
        let keyword = keyword.to_ascii_lowercase();
        for block in self.blocks.iter().filter(|block| block.matches(host)) {
            for (key, value) in &block.options {
                if *key == keyword {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Returns every `IdentityFile` value applying to `host`, in file
    /// order.
    #[must_use]
    pub fn identity_files(&self, host: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for block in self.blocks.iter().filter(|block| block.matches(host)) {
            for (key, value) in &block.options {
                if key == "identityfile" {
                    files.push(expand_home(value));
                }
            }
        }
        files
    }
}

/// Splits a directive line into keyword and value, accepting both the
/// whitespace form (`Port 22`) and the `=` form (`Port=22`).
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(split_at);
    let value = rest
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim();
    if keyword.is_empty() || value.is_empty() {
        None
    } else {
        Some((keyword, value))
    }
}

/// Shell-style pattern match supporting `*` and `?`.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    fn matches(pattern: &[u8], host: &[u8]) -> bool {
        match pattern.split_first() {
            None => host.is_empty(),
            Some((b'*', rest)) => {
                (0..=host.len()).any(|skip| matches(rest, &host[skip..]))
            }
            Some((b'?', rest)) => {
                !host.is_empty() && matches(rest, &host[1..])
            }
            Some((byte, rest)) => {
                host.first() == Some(byte) && matches(rest, &host[1..])
            }
        }
    }
    matches(pattern.as_bytes(), host.as_bytes())
}

/// Expands a leading `~/` against `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

fn parse_yes_no(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true")
}

/// Caller-supplied connection parameters.
///
/// Every field is optional; set fields override the configuration file
/// and the built-in defaults during [`resolve_host_config`].
#[derive(Debug, Clone, Default)]
pub struct SshConnectParameters {
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    identity_files: Vec<PathBuf>,
    connect_timeout: Option<Duration>,
    connection_attempts: Option<usize>,
    connection_interval: Option<Duration>,
    proxy_jump: Option<String>,
}

impl SshConnectParameters {
    /// Creates parameters with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TCP port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the login username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets a password used as the last authentication fallback.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Adds a private key file tried during authentication.
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_files.push(path.into());
        self
    }

    /// Sets the per-attempt connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the number of connection attempts.
    #[must_use]
    pub const fn with_connection_attempts(mut self, attempts: usize) -> Self {
        self.connection_attempts = Some(attempts);
        self
    }

    /// Sets the spacing between connection attempts.
    #[must_use]
    pub const fn with_connection_interval(mut self, interval: Duration) -> Self {
        self.connection_interval = Some(interval);
        self
    }

    /// Sets an explicit proxy-jump specification (`[user@]host[:port]`).
    #[must_use]
    pub fn with_proxy_jump(mut self, jump: impl Into<String>) -> Self {
        self.proxy_jump = Some(jump.into());
        self
    }

    /// Returns the configured password, when one was supplied.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

/// Fully resolved settings for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHostConfig {
    /// The alias the caller asked for (the config lookup key).
    pub host: String,
    /// Resolved hostname actually connected to.
    pub hostname: String,
    /// Resolved TCP port.
    pub port: u16,
    /// Resolved login username.
    pub username: String,
    /// Proxy-jump specification, when one applies.
    pub proxy_jump: Option<String>,
    /// Proxy command, when one applies (recognized but not executed by
    /// this layer).
    pub proxy_command: Option<String>,
    /// Private key files to try, strongest source first.
    pub identity_files: Vec<PathBuf>,
    /// Whether agent forwarding was requested.
    pub forward_agent: bool,
    /// Whether transport compression was requested.
    pub compression: bool,
    /// Per-attempt connection timeout.
    pub connect_timeout: Duration,
    /// Bounded number of connection attempts.
    pub connection_attempts: usize,
    /// Spacing between connection attempts.
    pub connection_interval: Duration,
}

impl SshHostConfig {
    /// Returns the `user@host:port` login string used in diagnostics.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Resolves the effective settings for `host`.
///
/// Precedence per field: explicit `parameters`, then the configuration
/// file, then defaults. The result is validated before it is returned;
/// validation failures are fail-fast and never retried.
pub fn resolve_host_config(
    config: &SshConfig,
    host: &str,
    parameters: &SshConnectParameters,
) -> Result<SshHostConfig, SshError> {
    if host.trim().is_empty() {
        return Err(SshError::InvalidParameters {
            reason: "hostname must not be empty".to_owned(),
        });
    }

    let hostname = config
        .lookup(host, "hostname")
        .map_or_else(|| host.to_owned(), str::to_owned);

    let port = match parameters.port {
        Some(port) => port,
        None => match config.lookup(host, "port") {
            Some(value) => value.parse::<u16>().map_err(|_| SshError::InvalidParameters {
                reason: format!("invalid port {value:?} for host {host:?}"),
            })?,
            None => DEFAULT_PORT,
        },
    };

    let username = parameters
        .username
        .clone()
        .or_else(|| config.lookup(host, "user").map(str::to_owned))
        .or_else(|| env::var("USER").ok())
        .unwrap_or_else(|| "root".to_owned());

    let connect_timeout = match parameters.connect_timeout {
        Some(timeout) => timeout,
        None => match config.lookup(host, "connecttimeout") {
            Some(value) => {
                let seconds = value.parse::<u64>().map_err(|_| SshError::InvalidParameters {
                    reason: format!("invalid ConnectTimeout {value:?} for host {host:?}"),
                })?;
                Duration::from_secs(seconds)
            }
            None => DEFAULT_CONNECT_TIMEOUT,
        },
    };

    let mut identity_files = parameters.identity_files.clone();
    identity_files.extend(config.identity_files(host));

    let resolved = SshHostConfig {
        host: host.to_owned(),
        hostname,
        port,
        username,
        proxy_jump: parameters
            .proxy_jump
            .clone()
            .or_else(|| config.lookup(host, "proxyjump").map(str::to_owned)),
        proxy_command: config.lookup(host, "proxycommand").map(str::to_owned),
        identity_files,
        forward_agent: config
            .lookup(host, "forwardagent")
            .is_some_and(parse_yes_no),
        compression: config
            .lookup(host, "compression")
            .is_some_and(parse_yes_no),
        connect_timeout,
        connection_attempts: parameters
            .connection_attempts
            .unwrap_or(DEFAULT_CONNECTION_ATTEMPTS),
        connection_interval: parameters
            .connection_interval
            .unwrap_or(DEFAULT_CONNECTION_INTERVAL),
    };
    validate(&resolved)?;
    Ok(resolved)
}

fn validate(config: &SshHostConfig) -> Result<(), SshError> {
    if config.hostname.trim().is_empty() {
        return Err(SshError::InvalidParameters {
            reason: "hostname must not be empty".to_owned(),
        });
    }
    if config.port == 0 {
        return Err(SshError::InvalidParameters {
            reason: format!("port must be in 1..=65535 for host {:?}", config.host),
        });
    }
    if config.connect_timeout.is_zero() {
        return Err(SshError::InvalidParameters {
            reason: format!("connect timeout must be positive for host {:?}", config.host),
        });
    }
    if config.connection_attempts == 0 {
        return Err(SshError::InvalidParameters {
            reason: format!(
                "connection attempts must be positive for host {:?}",
                config.host
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SAMPLE: &str = "\
# harness inventory
Host controller-*
    HostName 192.0.2.10
    User heat-admin
    Port 2022
    IdentityFile ~/.ssh/probe_key
    ProxyJump undercloud

Host undercloud
    HostName undercloud.example.org
    User stack
    ForwardAgent yes
    Compression yes
    ConnectTimeout 30

Host *
    User fallback
";

    #[test]
    fn first_matching_block_wins_per_option() {
        let config = SshConfig::parse(SAMPLE).expect("parse");
        assert_eq!(config.lookup("controller-0", "user"), Some("heat-admin"));
        assert_eq!(config.lookup("undercloud", "user"), Some("stack"));
        assert_eq!(config.lookup("unknown-host", "user"), Some("fallback"));
    }

    #[test]
    fn glob_patterns_match_prefixes_and_single_characters() {
        assert!(pattern_matches("controller-*", "controller-0"));
        assert!(pattern_matches("controller-?", "controller-2"));
        assert!(!pattern_matches("controller-?", "controller-10"));
        assert!(pattern_matches("*", "anything.example.org"));
        assert!(!pattern_matches("compute-*", "controller-0"));
    }

    #[test]
    fn negated_patterns_exclude_hosts() {
        let config = SshConfig::parse("Host * !bastion\n    Port 2222\n").expect("parse");
        assert_eq!(config.lookup("controller-0", "port"), Some("2222"));
        assert_eq!(config.lookup("bastion", "port"), None);
    }

    #[test]
    fn equals_form_directives_are_accepted() {
        let config = SshConfig::parse("Host box\n    Port=2200\n").expect("parse");
        assert_eq!(config.lookup("box", "port"), Some("2200"));
    }

    #[test]
    fn unsupported_directives_are_skipped() {
        let config = SshConfig::parse("Include other_config\nHost box\n    Port 22\n")
            .expect("parse despite Include");
        assert_eq!(config.lookup("box", "port"), Some("22"));
        assert_eq!(config.lookup("box", "include"), None);
    }

    #[test]
    fn identity_files_accumulate_across_blocks() {
        let text = "Host box\n    IdentityFile /keys/a\nHost *\n    IdentityFile /keys/b\n";
        let config = SshConfig::parse(text).expect("parse");
        let files = config.identity_files("box");
        assert_eq!(files, vec![PathBuf::from("/keys/a"), PathBuf::from("/keys/b")]);
    }

    #[test]
    fn load_reads_a_config_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "Host diskbox\n    HostName 198.51.100.7\n").expect("write");
        let config = SshConfig::load(file.path()).expect("load");
        assert_eq!(config.lookup("diskbox", "hostname"), Some("198.51.100.7"));
    }

    #[test]
    fn load_of_a_missing_file_is_empty() {
        let config =
            SshConfig::load(Path::new("/nonexistent/ssh/config")).expect("missing file tolerated");
        assert!(config.lookup("anything", "hostname").is_none());
    }

    #[test]
    fn explicit_parameters_override_config_and_defaults() {
        let config = SshConfig::parse(SAMPLE).expect("parse");
        let parameters = SshConnectParameters::new()
            .with_port(4422)
            .with_username("override");
        let resolved =
            resolve_host_config(&config, "controller-0", &parameters).expect("resolve");
        assert_eq!(resolved.port, 4422);
        assert_eq!(resolved.username, "override");
        assert_eq!(resolved.hostname, "192.0.2.10");
        assert_eq!(resolved.proxy_jump.as_deref(), Some("undercloud"));
    }

    #[test]
    fn config_values_override_defaults() {
        let config = SshConfig::parse(SAMPLE).expect("parse");
        let resolved = resolve_host_config(&config, "undercloud", &SshConnectParameters::new())
            .expect("resolve");
        assert_eq!(resolved.port, DEFAULT_PORT);
        assert_eq!(resolved.connect_timeout, Duration::from_secs(30));
        assert!(resolved.forward_agent);
        assert!(resolved.compression);
    }

    #[test]
    fn unknown_host_falls_back_to_defaults() {
        let resolved = resolve_host_config(
            &SshConfig::empty(),
            "plain.example.org",
            &SshConnectParameters::new(),
        )
        .expect("resolve");
        assert_eq!(resolved.hostname, "plain.example.org");
        assert_eq!(resolved.port, DEFAULT_PORT);
        assert_eq!(resolved.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(resolved.connection_attempts, DEFAULT_CONNECTION_ATTEMPTS);
    }

    #[test]
    fn empty_hostname_is_rejected() {
        let error = resolve_host_config(&SshConfig::empty(), "  ", &SshConnectParameters::new())
            .expect_err("empty hostname");
        assert!(matches!(error, SshError::InvalidParameters { .. }));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let parameters = SshConnectParameters::new().with_connect_timeout(Duration::ZERO);
        let error = resolve_host_config(&SshConfig::empty(), "box", &parameters)
            .expect_err("zero timeout");
        assert!(matches!(error, SshError::InvalidParameters { .. }));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let parameters = SshConnectParameters::new().with_connection_attempts(0);
        let error = resolve_host_config(&SshConfig::empty(), "box", &parameters)
            .expect_err("zero attempts");
        assert!(matches!(error, SshError::InvalidParameters { .. }));
    }

    #[test]
    fn bad_port_in_config_is_rejected() {
        let config = SshConfig::parse("Host box\n    Port 70000\n").expect("parse");
        let error = resolve_host_config(&config, "box", &SshConnectParameters::new())
            .expect_err("bad port");
        assert!(matches!(error, SshError::InvalidParameters { .. }));
    }

    #[test]
    fn login_renders_user_host_and_port() {
        let resolved = resolve_host_config(
            &SshConfig::empty(),
            "box",
            &SshConnectParameters::new()
                .with_username("probe")
                .with_port(2200),
        )
        .expect("resolve");
        assert_eq!(resolved.login(), "probe@box:2200");
    }
}
