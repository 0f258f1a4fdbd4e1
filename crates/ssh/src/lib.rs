#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `stackprobe-ssh` manages the SSH side of the stackprobe harness: it
//! resolves host configuration (explicit parameters over `~/.ssh/config`
//! values over built-in defaults), establishes sessions with a bounded
//! retry policy, chains connections through proxy-jump hosts via a local
//! tunnel forwarder, and caches one live client per logical target in a
//! process-wide registry.
//!
//! The crate deliberately stops at the transport layer. Running commands
//! over an established client (wiring a channel's stdin/stdout/stderr
//! into the readiness-polling process machinery) lives in
//! `stackprobe-shell`, which consumes [`SshClient::open_session_channel`].
//!
//! # Connection model
//!
//! A client is identified by its [`SshClientKey`]: normalized hostname,
//! port, username, and the key of its proxy-jump client when one applies.
//! [`SshClientManager::get_client`] is idempotent: repeated lookups with
//! an equivalent key return the same cached [`SshClient`] without a new
//! handshake. Sessions are lazy: nothing touches the network until
//! [`SshClient::connect`] (or a channel request) runs.
//!
//! Proxy-jump targets are resolved recursively through the same registry,
//! forming a chain. A host whose jump target resolves back to the host
//! itself yields no proxy at all rather than recursing forever.

mod client;
mod config;
mod error;
mod manager;
mod tunnel;

pub use client::{SshChannel, SshClient, SshClientKey};
pub use config::{SshConfig, SshConnectParameters, SshHostConfig, resolve_host_config};
pub use error::SshError;
pub use manager::SshClientManager;
pub use tunnel::TunnelForwarder;
