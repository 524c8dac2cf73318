//! Mapping from an inbound login to the one backend it may reach.

use std::{collections::HashMap, net::SocketAddr};

use secrecy::{ExposeSecret, SecretString};

use crate::{
    config::{FortressConfig, PrincipalEntry}, error::{RelayError, RelayResult}
};

/// A password attempt as seen by the listener.
#[derive(Debug)]
pub struct AuthAttempt {
    pub username: String,
    pub secret: SecretString,
    pub remote_address: Option<SocketAddr>,
}

impl AuthAttempt {
    pub fn new(username: &str, secret: &str, remote_address: Option<SocketAddr>) -> Self {
        Self {
            username: username.to_string(),
            secret: SecretString::new(secret.to_owned().into_boxed_str()),
            remote_address,
        }
    }
}

/// Resolved backend coordinates for one authenticated principal.
#[derive(Debug)]
pub struct TargetDescriptor {
    /// `host:port` as configured.
    pub address: String,
    pub username: String,
    /// Forwarded to the backend verbatim; never inspected here.
    pub credential: SecretString,
    /// Pinned OpenSSH public key line, if any.
    pub host_key: Option<String>,
}

impl TargetDescriptor {
    pub fn host_port(&self) -> Option<(&str, u16)> {
        split_host_port(&self.address)
    }
}

/// An authenticated client principal. Immutable once built.
#[derive(Debug)]
pub struct Identity {
    pub username: String,
    pub remote_address: Option<SocketAddr>,
    pub target: TargetDescriptor,
}

impl Identity {
    pub fn new(attempt: AuthAttempt, target: TargetDescriptor) -> Self {
        Self {
            username: attempt.username,
            remote_address: attempt.remote_address,
            target,
        }
    }
}

/// Decides which backend an authenticated login relays to.
///
/// This is the seam for real authorization (second factor, per-user routing, command
/// allow-lists); the relay itself only consumes the resulting [`TargetDescriptor`].
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, attempt: &AuthAttempt) -> RelayResult<TargetDescriptor>;
}

/// Fixed allow-list: every known principal maps to exactly one backend.
#[derive(Debug, Default)]
pub struct StaticResolver {
    principals: HashMap<String, PrincipalEntry>,
}

impl StaticResolver {
    pub fn new(entries: impl IntoIterator<Item = PrincipalEntry>) -> Self {
        Self {
            principals: entries.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn from_config(config: &FortressConfig) -> Self {
        Self::new(config.principals.iter().cloned())
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve(&self, attempt: &AuthAttempt) -> RelayResult<TargetDescriptor> {
        let entry = self
            .principals
            .get(&attempt.username)
            .ok_or_else(|| RelayError::AuthorizationDenied(attempt.username.clone()))?;

        Ok(TargetDescriptor {
            address: entry.backend_address.clone(),
            username: entry.backend_user.clone().unwrap_or_else(|| entry.name.clone()),
            credential: SecretString::new(attempt.secret.expose_secret().to_owned().into_boxed_str()),
            host_key: entry.host_key.clone(),
        })
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}
