//! Local TCP forwarding through an SSH jump host.
//!
//! libssh2 sessions require a real socket descriptor as their transport,
//! so a proxied connection cannot hand the jump host's `direct-tcpip`
//! channel straight to the next session the way an agent-style SSH
//! library would. Instead a [`TunnelForwarder`] binds a loopback
//! listener, bridges the one accepted connection to the channel from a
//! background thread, and the proxied session dials the loopback address
//! as if it were the real target.
//!
//! The pump thread owns a session dedicated to the tunnel, so flipping
//! that session into non-blocking mode cannot race command execution on
//! the jump host's cached client.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, trace, warn};

use crate::error::SshError;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// One active port forward: loopback listener on this side, a
/// `direct-tcpip` channel to the target on the other.
pub struct TunnelForwarder {
    target: (String, u16),
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TunnelForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelForwarder")
            .field("target", &self.target)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl TunnelForwarder {
    /// Opens a forward to `target:port` over `session`.
    ///
    /// The session must be freshly established and becomes the exclusive
    /// property of the forwarder's pump thread.
    pub(crate) fn open(session: Session, target: &str, port: u16) -> Result<Self, SshError> {
        let channel = session.channel_direct_tcpip(target, port, None)?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        session.set_blocking(false);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread_target = format!("{target}:{port}");
        let thread = thread::Builder::new()
            .name(format!("ssh-tunnel-{thread_target}"))
            .spawn(move || pump(&listener, session, channel, &flag, &thread_target))?;

        debug!(target, port, %local_addr, "tunnel forwarder listening");
        Ok(Self {
            target: (target.to_owned(), port),
            local_addr,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Returns the loopback address the proxied session should dial.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the `(host, port)` target behind the jump host.
    #[must_use]
    pub fn target(&self) -> (&str, u16) {
        (&self.target.0, self.target.1)
    }

    /// Stops the pump thread. Idempotent.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(target = %self.target.0, port = self.target.1, "tunnel pump thread panicked");
        }
    }
}

impl Drop for TunnelForwarder {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Bridges the single accepted loopback connection with the channel.
///
/// Both ends run non-blocking; a round with no progress in either
/// direction sleeps briefly instead of spinning. The session is moved in
/// solely to keep the transport alive for the channel's lifetime.
fn pump(
    listener: &TcpListener,
    _session: Session,
    mut channel: ssh2::Channel,
    shutdown: &AtomicBool,
    target: &str,
) {
    let mut stream = loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) => {
                warn!(target, %error, "tunnel accept failed");
                return;
            }
        }
    };
    if let Err(error) = stream.set_nonblocking(true) {
        warn!(target, %error, "tunnel stream setup failed");
        return;
    }

    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
    let mut to_remote: Vec<u8> = Vec::new();
    let mut to_local: Vec<u8> = Vec::new();
    let mut local_eof = false;
    let mut remote_eof = false;

    while !shutdown.load(Ordering::Relaxed) {
        let mut progressed = false;

        if !local_eof && to_remote.is_empty() {
            match stream.read(&mut buffer) {
                Ok(0) => {
                    local_eof = true;
                    let _ = channel.send_eof();
                    progressed = true;
                }
                Ok(n) => {
                    to_remote.extend_from_slice(&buffer[..n]);
                    progressed = true;
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    trace!(target, %error, "tunnel local read failed");
                    break;
                }
            }
        }
        if !to_remote.is_empty() {
            match channel.write(&to_remote) {
                Ok(n) if n > 0 => {
                    to_remote.drain(..n);
                    progressed = true;
                }
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    trace!(target, %error, "tunnel channel write failed");
                    break;
                }
            }
        }

        if !remote_eof && to_local.is_empty() {
            match channel.read(&mut buffer) {
                Ok(0) => {
                    remote_eof = true;
                    progressed = true;
                }
                Ok(n) => {
                    to_local.extend_from_slice(&buffer[..n]);
                    progressed = true;
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        remote_eof = true;
                    }
                }
                Err(error) => {
                    trace!(target, %error, "tunnel channel read failed");
                    break;
                }
            }
        }
        if !to_local.is_empty() {
            match stream.write(&to_local) {
                Ok(n) if n > 0 => {
                    to_local.drain(..n);
                    progressed = true;
                }
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    trace!(target, %error, "tunnel local write failed");
                    break;
                }
            }
        }

        if local_eof && remote_eof && to_remote.is_empty() && to_local.is_empty() {
            break;
        }
        if !progressed {
            thread::sleep(PUMP_POLL_INTERVAL);
        }
    }

    let _ = channel.close();
    debug!(target, "tunnel pump finished");
}
