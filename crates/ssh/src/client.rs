//! Pooled SSH client with bounded connection and channel retries.

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use ssh2::Session;
use stackprobe_retry::Retry;
use tracing::{debug, warn};

use crate::config::SshHostConfig;
use crate::error::{SshError, is_timeout_error};
use crate::tunnel::TunnelForwarder;

const CHANNEL_RETRY_COUNT: usize = 3;
const CHANNEL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Normalized identity of one logical SSH target.
///
/// Two lookups that resolve to the same hostname, port, username, and
/// proxy chain share one cached client. The proxy link makes the chain
/// part of the identity: reaching the same host directly and through a
/// jump host are different targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshClientKey {
    /// Resolved hostname.
    pub hostname: String,
    /// Resolved TCP port.
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Identity of the proxy-jump client, when the route uses one.
    pub proxy: Option<Box<SshClientKey>>,
}

impl fmt::Display for SshClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}

/// An open session channel plus the session's socket descriptor.
///
/// The descriptor lets callers include channel streams in a `poll(2)`
/// wait: data arriving for any channel of the session wakes the poll,
/// after which channel-level readiness must be probed non-blockingly.
pub struct SshChannel {
    /// The exec-capable channel.
    pub channel: ssh2::Channel,
    /// Raw descriptor of the session's TCP transport.
    pub socket_fd: RawFd,
}

impl fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshChannel")
            .field("socket_fd", &self.socket_fd)
            .finish_non_exhaustive()
    }
}

struct SessionState {
    session: Session,
    socket_fd: RawFd,
}

/// A reusable SSH client for one [`SshClientKey`].
///
/// Sessions are lazy: the client is cheap to construct and nothing
/// touches the network until [`connect`](Self::connect) or a channel
/// request runs. Connection establishment is retried within the bounds
/// carried by the resolved host configuration; once the attempts are
/// exhausted the last underlying error propagates unchanged.
pub struct SshClient {
    key: SshClientKey,
    config: SshHostConfig,
    password: Option<String>,
    proxy: Option<Arc<SshClient>>,
    state: Mutex<Option<SessionState>>,
    tunnels: DashMap<(String, u16), Arc<TunnelForwarder>>,
}

impl fmt::Debug for SshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClient")
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Creates an unconnected client.
    #[must_use]
    pub fn new(
        key: SshClientKey,
        config: SshHostConfig,
        password: Option<String>,
        proxy: Option<Arc<SshClient>>,
    ) -> Self {
        Self {
            key,
            config,
            password,
            proxy,
            state: Mutex::new(None),
            tunnels: DashMap::new(),
        }
    }

    /// Returns the client's identity.
    #[must_use]
    pub const fn key(&self) -> &SshClientKey {
        &self.key
    }

    /// Returns the resolved host configuration.
    #[must_use]
    pub const fn config(&self) -> &SshHostConfig {
        &self.config
    }

    /// Returns the proxy-jump client, when the route uses one.
    #[must_use]
    pub const fn proxy(&self) -> Option<&Arc<SshClient>> {
        self.proxy.as_ref()
    }

    /// Returns the `user@host:port` login string.
    #[must_use]
    pub fn login(&self) -> String {
        self.config.login()
    }

    /// Returns `true` while a live session is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock_state().is_some()
    }

    /// Ensures a live session, performing the bounded connect sequence
    /// when none is held.
    ///
    /// Transient establishment failures (refused, timed out, handshake
    /// errors) are retried up to the configured attempt count with the
    /// configured interval; after exhaustion the last error propagates
    /// unchanged. Validation and authentication failures are never
    /// retried.
    pub fn connect(&self) -> Result<(), SshError> {
        let mut guard = self.lock_state();
        if guard.is_some() {
            return Ok(());
        }

        let retry = Retry::new()
            .with_count(self.config.connection_attempts)
            .with_interval(self.config.connection_interval);
        let mut last: Option<SshError> = None;
        for attempt in retry.attempts() {
            match self.establish_session() {
                Ok(state) => {
                    *guard = Some(state);
                    return Ok(());
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        login = %self.login(),
                        attempt = attempt.number(),
                        %error,
                        "SSH connection attempt failed"
                    );
                    let exhausted = attempt.is_last();
                    last = Some(error);
                    if exhausted {
                        break;
                    }
                    retry.sleep_interval();
                }
                Err(error) => return Err(error),
            }
        }
        let Some(error) = last else {
            return Err(SshError::InvalidParameters {
                reason: "connection attempts must be positive".to_owned(),
            });
        };
        Err(error)
    }

    /// Drops the session and any tunnels derived from it.
    ///
    /// The next channel request reconnects from scratch; used after a
    /// target host reboots.
    pub fn disconnect(&self) {
        self.tunnels.clear();
        *self.lock_state() = None;
    }

    /// Opens a `session` channel suitable for an `exec` request.
    ///
    /// Transient channel failures trigger a bounded
    /// disconnect/reconnect/retry cycle; a transport-level timeout is
    /// fatal immediately. The channel is returned in blocking mode;
    /// callers switch the session to non-blocking once their `exec`
    /// request is in flight.
    pub fn open_session_channel(&self) -> Result<SshChannel, SshError> {
        self.connect()?;

        let retry = Retry::new()
            .with_count(CHANNEL_RETRY_COUNT)
            .with_interval(CHANNEL_RETRY_INTERVAL);
        let mut last: Option<ssh2::Error> = None;
        for attempt in retry.attempts() {
            match self.try_open_channel() {
                Ok(channel) => return Ok(channel),
                Err(error) if is_timeout_error(&error) => {
                    return Err(SshError::Timeout {
                        login: self.login(),
                        timeout: self.config.connect_timeout,
                    });
                }
                Err(error) => {
                    warn!(
                        login = %self.login(),
                        attempt = attempt.number(),
                        %error,
                        "SSH channel open failed; reconnecting"
                    );
                    let exhausted = attempt.is_last();
                    last = Some(error);
                    if exhausted {
                        break;
                    }
                    self.disconnect();
                    retry.sleep_interval();
                    self.connect()?;
                }
            }
        }
        let Some(source) = last else {
            return Err(SshError::InvalidParameters {
                reason: "channel retry count must be positive".to_owned(),
            });
        };
        Err(SshError::ChannelOpen {
            login: self.login(),
            source,
        })
    }

    /// Switches the held session's blocking mode.
    pub fn set_blocking(&self, blocking: bool) {
        if let Some(state) = self.lock_state().as_ref() {
            state.session.set_blocking(blocking);
        }
    }

    /// Returns (creating on demand) a tunnel forwarding `target:port`
    /// through this client.
    ///
    /// Each `(target, port)` pair gets one forwarder, backed by a session
    /// dedicated to the tunnel; repeated requests reuse the live entry.
    pub fn forward_to(&self, target: &str, port: u16) -> Result<Arc<TunnelForwarder>, SshError> {
        let key = (target.to_owned(), port);
        if let Some(existing) = self.tunnels.get(&key) {
            return Ok(Arc::clone(&existing));
        }
        let state = self.establish_session()?;
        let forwarder = Arc::new(TunnelForwarder::open(state.session, target, port)?);
        self.tunnels.insert(key, Arc::clone(&forwarder));
        Ok(forwarder)
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<SessionState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_open_channel(&self) -> Result<SshChannel, ssh2::Error> {
        let guard = self.lock_state();
        let Some(state) = guard.as_ref() else {
            return Err(ssh2::Error::new(
                ssh2::ErrorCode::Session(-1),
                "session not established",
            ));
        };
        state.session.set_blocking(true);
        let channel = state.session.channel_session()?;
        Ok(SshChannel {
            channel,
            socket_fd: state.socket_fd,
        })
    }

    /// Performs one full establishment: transport, handshake,
    /// authentication, keepalive.
    fn establish_session(&self) -> Result<SessionState, SshError> {
        let login = self.login();
        let tcp = self.open_transport()?;
        let socket_fd = tcp.as_raw_fd();

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(self.config.connect_timeout));
        if self.config.compression {
            session.set_compress(true);
        }
        session.handshake().map_err(|error| SshError::Connect {
            login: login.clone(),
            source: error.into(),
        })?;

        self.authenticate(&session)?;
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        debug!(login = %login, "SSH session established");
        Ok(SessionState { session, socket_fd })
    }

    /// Dials the target, through the proxy tunnel when one applies.
    fn open_transport(&self) -> Result<TcpStream, SshError> {
        let login = self.login();
        let connect = |addr| {
            TcpStream::connect_timeout(&addr, self.config.connect_timeout).map_err(|source| {
                SshError::Connect {
                    login: login.clone(),
                    source,
                }
            })
        };

        if let Some(proxy) = &self.proxy {
            let tunnel = proxy.forward_to(&self.config.hostname, self.config.port)?;
            return connect(tunnel.local_addr());
        }

        let addr = (self.config.hostname.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| SshError::Connect {
                login: login.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| SshError::Connect {
                login: login.clone(),
                source: io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "hostname resolved to no addresses",
                ),
            })?;
        connect(addr)
    }

    /// Tries the agent, then each identity file, then the password.
    fn authenticate(&self, session: &Session) -> Result<(), SshError> {
        let username = &self.config.username;
        if let Err(error) = session.userauth_agent(username) {
            debug!(login = %self.login(), %error, "agent authentication unavailable");
        }
        if session.authenticated() {
            return Ok(());
        }

        for identity in &self.config.identity_files {
            if !identity.exists() {
                continue;
            }
            if let Err(error) = session.userauth_pubkey_file(username, None, identity, None) {
                debug!(
                    login = %self.login(),
                    identity = %identity.display(),
                    %error,
                    "public key authentication failed"
                );
            }
            if session.authenticated() {
                return Ok(());
            }
        }

        if let Some(password) = &self.password {
            if let Err(error) = session.userauth_password(username, password) {
                debug!(login = %self.login(), %error, "password authentication failed");
            }
            if session.authenticated() {
                return Ok(());
            }
        }

        Err(SshError::Auth {
            login: self.login(),
            reason: "agent, public key, and password methods all failed".to_owned(),
        })
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SshConfig, SshConnectParameters, resolve_host_config};
    use std::net::TcpListener;

    fn client_for(host: &str, parameters: &SshConnectParameters) -> SshClient {
        let config =
            resolve_host_config(&SshConfig::empty(), host, parameters).expect("resolve");
        let key = SshClientKey {
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone(),
            proxy: None,
        };
        SshClient::new(key, config, None, None)
    }

    fn test_client(host: &str) -> SshClient {
        client_for(host, &SshConnectParameters::new().with_username("probe"))
    }

    #[test]
    fn client_key_display_includes_proxy_chain() {
        let key = SshClientKey {
            hostname: "controller-0".to_owned(),
            port: 22,
            username: "probe".to_owned(),
            proxy: Some(Box::new(SshClientKey {
                hostname: "bastion".to_owned(),
                port: 2222,
                username: "jump".to_owned(),
                proxy: None,
            })),
        };
        assert_eq!(
            key.to_string(),
            "probe@controller-0:22 via jump@bastion:2222"
        );
    }

    #[test]
    fn fresh_client_is_not_connected() {
        let client = test_client("nowhere.invalid");
        assert!(!client.is_connected());
    }

    #[test]
    fn disconnect_without_session_is_harmless() {
        let client = test_client("nowhere.invalid");
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[test]
    fn login_comes_from_the_resolved_config() {
        let client = test_client("controller-0");
        assert_eq!(client.login(), "probe@controller-0:22");
    }

    #[test]
    fn connect_exhausts_its_attempts_and_surfaces_the_last_error() {
        // Bind then drop a loopback listener so the port is (almost
        // certainly) refused rather than timing out.
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let parameters = SshConnectParameters::new()
            .with_username("probe")
            .with_port(port)
            .with_connection_attempts(2)
            .with_connection_interval(Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(500));
        let client = client_for("127.0.0.1", &parameters);

        let error = client.connect().expect_err("refused");
        assert!(matches!(error, SshError::Connect { .. }));
        assert!(!client.is_connected());
    }
}
