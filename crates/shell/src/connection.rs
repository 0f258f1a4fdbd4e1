#![allow(unsafe_code)]

//! Shell connection registry.
//!
//! A [`ShellConnection`] describes a reusable execution context: the
//! local machine or a specific SSH target. The
//! [`ShellConnectionManager`] holds at most one live connection per
//! target key; lookups are idempotent and entries are only invalidated
//! by explicit cleanup (e.g. after a host reboot forces reconnection).
//! The manager does not own processes, only the context that can spawn
//! them.

use std::env;
use std::sync::Arc;

use dashmap::DashMap;
use stackprobe_ssh::{SshClient, SshClientKey};

use crate::process::ExecutionTarget;

/// A reusable execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConnection {
    hostname: String,
    username: String,
    is_local: bool,
}

impl ShellConnection {
    /// The local-machine connection.
    #[must_use]
    pub fn local() -> Self {
        Self {
            hostname: local_hostname(),
            username: local_username(),
            is_local: true,
        }
    }

    /// Connection description for an SSH client.
    #[must_use]
    pub fn for_client(client: &SshClient) -> Self {
        Self {
            hostname: client.key().hostname.clone(),
            username: client.key().username.clone(),
            is_local: false,
        }
    }

    /// The target hostname.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The login username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The `user@host` login string.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    /// Returns `true` for the local-machine connection.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.is_local
    }
}

/// Registry mapping execution targets to shared [`ShellConnection`]s.
///
/// Keys are `None` for the local machine and the SSH client identity
/// otherwise; this is a shared-by-lookup relationship, not ownership:
/// the manager's lifetime may exceed any individual connection's use.
#[derive(Debug, Default)]
pub struct ShellConnectionManager {
    connections: DashMap<Option<SshClientKey>, Arc<ShellConnection>>,
}

impl ShellConnectionManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection for `target`, creating it on first use.
    #[must_use]
    pub fn get_connection(&self, target: &ExecutionTarget) -> Arc<ShellConnection> {
        let key = target.ssh_client().map(|client| client.key().clone());
        let entry = self.connections.entry(key).or_insert_with(|| {
            Arc::new(match target {
                ExecutionTarget::Local => ShellConnection::local(),
                ExecutionTarget::Ssh(client) => ShellConnection::for_client(client),
            })
        });
        Arc::clone(entry.value())
    }

    /// Pre-seeds the registry, replacing any existing entry for the key.
    pub fn register_connection(
        &self,
        key: Option<SshClientKey>,
        connection: Arc<ShellConnection>,
    ) {
        self.connections.insert(key, connection);
    }

    /// Removes one entry, returning the evicted connection.
    pub fn remove_connection(&self, key: &Option<SshClientKey>) -> Option<Arc<ShellConnection>> {
        self.connections.remove(key).map(|(_, connection)| connection)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.connections.clear();
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` when no connection is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn local_username() -> String {
    env::var("USER").unwrap_or_else(|_| "root".to_owned())
}

fn local_hostname() -> String {
    let mut buffer = [0u8; 256];
    let rc = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if rc == 0 {
        let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        if end > 0 {
            return String::from_utf8_lossy(&buffer[..end]).into_owned();
        }
    }
    "localhost".to_owned()
}
