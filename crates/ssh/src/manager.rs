//! Process-wide SSH client registry.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::client::{SshClient, SshClientKey};
use crate::config::{SshConfig, SshConnectParameters, resolve_host_config};
use crate::error::SshError;

/// Registry mapping a normalized target identity to at most one live
/// [`SshClient`].
///
/// `get_client` is idempotent: repeated calls with an equivalent key
/// return the identical cached `Arc` without re-establishing anything.
/// The registry is an explicitly constructed instance owned by the
/// harness context, not ambient global state; entries are only
/// invalidated by explicit cleanup (e.g. after a host reboot forces
/// reconnection).
///
/// Proxy-jump targets are resolved recursively through the same
/// registry, so a jump host's client is shared between its role as a hop
/// and any direct use.
#[derive(Debug, Default)]
pub struct SshClientManager {
    config: SshConfig,
    clients: DashMap<SshClientKey, Arc<SshClient>>,
}

impl SshClientManager {
    /// Creates a registry with no configuration file content.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry resolving hosts against `config`.
    #[must_use]
    pub fn with_config(config: SshConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    /// Creates a registry resolving hosts against the current user's
    /// `~/.ssh/config`.
    pub fn from_user_config() -> Result<Self, SshError> {
        Ok(Self::with_config(SshConfig::load_user_config()?))
    }

    /// Returns the cached client for `host`, creating it on first use.
    pub fn get_client(&self, host: &str) -> Result<Arc<SshClient>, SshError> {
        self.get_client_with(host, &SshConnectParameters::new())
    }

    /// Returns the cached client for `host` under explicit parameters.
    ///
    /// The parameters participate in resolution (and therefore in the
    /// cache key): asking for the same host with a different username or
    /// port yields a distinct client.
    pub fn get_client_with(
        &self,
        host: &str,
        parameters: &SshConnectParameters,
    ) -> Result<Arc<SshClient>, SshError> {
        let config = resolve_host_config(&self.config, host, parameters)?;

        let proxy = self.resolve_proxy(host, &config)?;
        let key = SshClientKey {
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone(),
            proxy: proxy.as_ref().map(|client| Box::new(client.key().clone())),
        };

        if let Some(existing) = self.clients.get(&key) {
            return Ok(Arc::clone(&existing));
        }
        let client = Arc::new(SshClient::new(
            key.clone(),
            config,
            parameters.password().map(str::to_owned),
            proxy,
        ));
        let entry = self
            .clients
            .entry(key)
            .or_insert_with(|| Arc::clone(&client));
        Ok(entry.value().clone())
    }

    /// Pre-seeds the registry with an externally constructed client.
    ///
    /// An existing entry for the same key is replaced; used by reboot
    /// handling to install a reconnected client.
    pub fn register_client(&self, client: Arc<SshClient>) {
        self.clients.insert(client.key().clone(), client);
    }

    /// Removes one cache entry, returning the evicted client.
    pub fn remove_client(&self, key: &SshClientKey) -> Option<Arc<SshClient>> {
        self.clients.remove(key).map(|(_, client)| client)
    }

    /// Drops every cache entry.
    pub fn clear(&self) {
        self.clients.clear();
    }

    /// Number of cached clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no client is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Resolves the proxy-jump client for `config`, recursing through
    /// this registry.
    ///
    /// A jump target that resolves back to the host itself yields no
    /// proxy at all: the pathological self-referencing configuration
    /// falls back to a direct connection instead of recursing forever.
    /// Longer cycles (A → B → A) are not detected, matching the original
    /// harness behavior.
    fn resolve_proxy(
        &self,
        host: &str,
        config: &crate::config::SshHostConfig,
    ) -> Result<Option<Arc<SshClient>>, SshError> {
        let Some(jump_spec) = &config.proxy_jump else {
            return Ok(None);
        };

        let (jump_user, jump_host, jump_port) = parse_jump_spec(jump_spec)?;
        if jump_host == host {
            debug!(host, "proxy jump references the host itself; connecting directly");
            return Ok(None);
        }

        let mut jump_parameters = SshConnectParameters::new();
        if let Some(user) = jump_user {
            jump_parameters = jump_parameters.with_username(user);
        }
        if let Some(port) = jump_port {
            jump_parameters = jump_parameters.with_port(port);
        }

        let jump_config = resolve_host_config(&self.config, jump_host, &jump_parameters)?;
        if jump_config.hostname == config.hostname {
            debug!(
                host,
                jump = jump_host,
                "proxy jump resolves to the host's own hostname; connecting directly"
            );
            return Ok(None);
        }

        self.get_client_with(jump_host, &jump_parameters).map(Some)
    }
}

/// Parses a `[user@]host[:port]` proxy-jump specification.
///
/// Multi-hop lists are honored one hop at a time: only the first entry is
/// used here, and further hops come from that host's own configuration.
fn parse_jump_spec(spec: &str) -> Result<(Option<&str>, &str, Option<u16>), SshError> {
    let first = match spec.split_once(',') {
        Some((first, rest)) => {
            warn!(
                rest,
                "multi-hop ProxyJump list; using the first hop and deferring the rest to its config"
            );
            first
        }
        None => spec,
    };

    let (user, target) = match first.split_once('@') {
        Some((user, target)) => (Some(user), target),
        None => (None, first),
    };

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_text)) => {
            let port = port_text
                .parse::<u16>()
                .map_err(|_| SshError::InvalidParameters {
                    reason: format!("invalid port in ProxyJump specification {spec:?}"),
                })?;
            (host, Some(port))
        }
        None => (target, None),
    };

    if host.is_empty() {
        return Err(SshError::InvalidParameters {
            reason: format!("empty host in ProxyJump specification {spec:?}"),
        });
    }
    Ok((user, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(text: &str) -> SshClientManager {
        SshClientManager::with_config(SshConfig::parse(text).expect("parse"))
    }

    #[test]
    fn repeated_lookups_return_the_identical_client() {
        let manager = SshClientManager::new();
        let first = manager.get_client("controller-0").expect("client");
        let second = manager.get_client("controller-0").expect("client");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn different_parameters_yield_distinct_clients() {
        let manager = SshClientManager::new();
        let plain = manager.get_client("controller-0").expect("client");
        let other = manager
            .get_client_with(
                "controller-0",
                &SshConnectParameters::new().with_username("other"),
            )
            .expect("client");
        assert!(!Arc::ptr_eq(&plain, &other));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn proxy_jump_builds_a_client_chain() {
        let manager = manager_with(
            "Host inner\n    HostName inner.example.org\n    ProxyJump outer\n\
             Host outer\n    HostName outer.example.org\n",
        );
        let inner = manager.get_client("inner").expect("client");
        let proxy = inner.proxy().expect("proxy client");
        assert_eq!(proxy.key().hostname, "outer.example.org");
        assert_eq!(
            inner.key().proxy.as_deref(),
            Some(proxy.key())
        );
        // Both the target and its hop live in the same registry.
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn jump_spec_user_and_port_are_honored() {
        let manager = manager_with(
            "Host inner\n    ProxyJump hop@outer.example.org:2222\n",
        );
        let inner = manager.get_client("inner").expect("client");
        let proxy = inner.proxy().expect("proxy client");
        assert_eq!(proxy.key().username, "hop");
        assert_eq!(proxy.key().port, 2222);
    }

    #[test]
    fn self_referencing_proxy_falls_back_to_direct_connection() {
        let manager = manager_with("Host widget\n    ProxyJump widget\n");
        let client = manager.get_client("widget").expect("client");
        assert!(client.proxy().is_none());
        assert!(client.key().proxy.is_none());
    }

    #[test]
    fn proxy_resolving_to_own_hostname_falls_back_to_direct_connection() {
        let manager = manager_with(
            "Host widget\n    HostName shared.example.org\n    ProxyJump gateway\n\
             Host gateway\n    HostName shared.example.org\n",
        );
        let client = manager.get_client("widget").expect("client");
        assert!(client.proxy().is_none());
    }

    #[test]
    fn remove_client_evicts_only_that_entry() {
        let manager = SshClientManager::new();
        let a = manager.get_client("host-a").expect("client");
        let _b = manager.get_client("host-b").expect("client");
        let evicted = manager.remove_client(a.key()).expect("evicted");
        assert!(Arc::ptr_eq(&a, &evicted));
        assert_eq!(manager.len(), 1);

        let replacement = manager.get_client("host-a").expect("client");
        assert!(!Arc::ptr_eq(&a, &replacement));
    }

    #[test]
    fn register_client_preseeds_the_cache() {
        let manager = SshClientManager::new();
        let client = manager.get_client("host-a").expect("client");
        let other = SshClientManager::new();
        other.register_client(Arc::clone(&client));
        let cached = other.get_client("host-a").expect("client");
        assert!(Arc::ptr_eq(&client, &cached));
    }

    #[test]
    fn clear_empties_the_registry() {
        let manager = SshClientManager::new();
        let _ = manager.get_client("host-a").expect("client");
        assert!(!manager.is_empty());
        manager.clear();
        assert!(manager.is_empty());
    }

    #[test]
    fn parse_jump_spec_variants() {
        assert_eq!(
            parse_jump_spec("bastion").expect("parse"),
            (None, "bastion", None)
        );
        assert_eq!(
            parse_jump_spec("probe@bastion").expect("parse"),
            (Some("probe"), "bastion", None)
        );
        assert_eq!(
            parse_jump_spec("probe@bastion:2222").expect("parse"),
            (Some("probe"), "bastion", Some(2222))
        );
        assert!(parse_jump_spec("probe@:22").is_err());
        assert!(parse_jump_spec("bastion:notaport").is_err());
    }
}
