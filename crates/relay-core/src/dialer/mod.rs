//! Outbound leg: connect and authenticate to the backend on behalf of the client.

use std::{
    future::Future, sync::{
        Arc, atomic::{AtomicBool, Ordering}
    }, time::Duration
};

use russh::{
    Disconnect, client, keys::{HashAlg, PublicKey}
};
use secrecy::ExposeSecret;
use ssh_core::crypto::{default_preferred, legacy_preferred};
use tracing::{debug, info, warn};

use crate::{
    config::FortressConfig, error::{RelayError, RelayResult}, identity::TargetDescriptor
};

pub mod exec;

pub use exec::BackendExec;

/// Builds russh client sessions towards backends.
pub struct BackendDialer {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl BackendDialer {
    pub fn from_config(config: &FortressConfig) -> Self {
        let backend = &config.backend;
        let client_config = client::Config {
            preferred: if backend.legacy_crypto {
                legacy_preferred()
            } else {
                default_preferred()
            },
            nodelay: true,
            inactivity_timeout: None,
            keepalive_interval: (backend.keepalive_secs > 0).then(|| Duration::from_secs(backend.keepalive_secs)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(client_config),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Connect to `target.address` and authenticate with the forwarded credential.
    ///
    /// Failures are logged here, once, with their kind.
    pub async fn dial(&self, target: &TargetDescriptor) -> RelayResult<BackendConnection> {
        let result = self.try_dial(target).await;
        if let Err(e) = &result {
            warn!(backend = %target.address, user = %target.username, kind = e.kind(), error = %e, "backend dial failed");
        }
        result
    }

    async fn try_dial(&self, target: &TargetDescriptor) -> RelayResult<BackendConnection> {
        let (host, port) = target
            .host_port()
            .ok_or_else(|| RelayError::unreachable(&target.address, "address is not host:port"))?;

        let mismatch = Arc::new(AtomicBool::new(false));
        let handler = BackendHandler {
            address: target.address.clone(),
            pinned: target.host_key.clone(),
            mismatch: mismatch.clone(),
        };

        debug!(backend = %target.address, "connecting to backend");
        let connect = client::connect(self.config.clone(), (host, port), handler);
        let mut handle = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(_)) if mismatch.load(Ordering::Acquire) => {
                return Err(RelayError::unreachable(&target.address, "host key does not match the pinned key"));
            }
            Ok(Err(e)) => return Err(RelayError::unreachable(&target.address, e)),
            Err(_) => {
                return Err(RelayError::unreachable(
                    &target.address,
                    format!("no handshake within {:?}", self.connect_timeout),
                ));
            }
        };

        let auth = handle
            .authenticate_password(target.username.clone(), target.credential.expose_secret().to_string())
            .await
            .map_err(|e| RelayError::unreachable(&target.address, e))?;
        if !auth.success() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "").await;
            return Err(RelayError::BackendAuthRejected {
                address: target.address.clone(),
                username: target.username.clone(),
            });
        }

        info!(backend = %target.address, user = %target.username, "backend session established");
        Ok(BackendConnection {
            handle,
            address: target.address.clone(),
        })
    }
}

/// An authenticated backend session.
pub struct BackendConnection {
    handle: client::Handle<BackendHandler>,
    address: String,
}

impl BackendConnection {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open the single execution channel a relay session drives.
    pub async fn open_exec(&self) -> RelayResult<BackendExec> {
        let channel = self.handle.channel_open_session().await?;
        debug!(backend = %self.address, channel = ?channel.id(), "backend channel opened");
        Ok(BackendExec::spawn(channel))
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.handle.disconnect(Disconnect::ByApplication, "", "").await {
            debug!(backend = %self.address, error = %e, "backend disconnect");
        }
    }
}

/// Client-side handler for the backend leg. Only host-key policy lives here.
pub struct BackendHandler {
    address: String,
    pinned: Option<String>,
    mismatch: Arc<AtomicBool>,
}

impl client::Handler for BackendHandler {
    type Error = RelayError;

    fn check_server_key(&mut self, key: &PublicKey) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let presented = key.to_openssh().map(|s| s.to_string()).unwrap_or_default();
        let algo = key.algorithm().to_string();
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let pinned = self.pinned.clone();
        let address = self.address.clone();
        let mismatch = self.mismatch.clone();
        async move {
            match pinned {
                Some(expected) if same_key(&expected, &presented) => {
                    debug!(backend = %address, algo, fp = %fingerprint, "backend host key matches pin");
                    Ok(true)
                }
                Some(_) => {
                    mismatch.store(true, Ordering::Release);
                    debug!(backend = %address, algo, fp = %fingerprint, "backend host key mismatch");
                    Ok(false)
                }
                None => {
                    info!(backend = %address, algo, fp = %fingerprint, "accepting unpinned backend host key");
                    Ok(true)
                }
            }
        }
    }
}

/// Compare two OpenSSH public key lines by algorithm and key blob, ignoring comments.
fn same_key(a: &str, b: &str) -> bool {
    let mut a = a.split_whitespace();
    let mut b = b.split_whitespace();
    let (Some(a_algo), Some(a_blob), Some(b_algo), Some(b_blob)) = (a.next(), a.next(), b.next(), b.next()) else {
        return false;
    };
    a_algo == b_algo && a_blob == b_blob
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn target(address: &str) -> TargetDescriptor {
        TargetDescriptor {
            address: address.to_string(),
            username: "hago".to_string(),
            credential: SecretString::new("pw".to_string().into_boxed_str()),
            host_key: None,
        }
    }

    #[test]
    fn key_comparison_ignores_comments() {
        let blob = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHqbRUa7nCMyZOOuUvVxmDLJSZ6GsYpRuVk0kJ5P2xJb";
        assert!(same_key(blob, &format!("{blob} root@backend")));
        assert!(same_key(&format!("  {blob}\n"), blob));
        assert!(!same_key(blob, "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ"));
        assert!(!same_key(blob, ""));
    }

    #[tokio::test]
    async fn refused_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = BackendDialer::from_config(&FortressConfig::default());
        let err = dialer.dial(&target(&address)).await.err().unwrap();
        assert!(matches!(err, RelayError::BackendUnreachable { .. }), "{err:?}");
        assert_eq!(err.kind(), "backend_unreachable");
    }

    #[tokio::test]
    async fn malformed_address_is_unreachable() {
        let dialer = BackendDialer::from_config(&FortressConfig::default());
        let err = dialer.dial(&target("no-port-here")).await.err().unwrap();
        assert!(matches!(err, RelayError::BackendUnreachable { .. }));
    }

    #[tokio::test]
    async fn silent_peer_hits_the_connect_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mut config = FortressConfig::default();
        config.backend.connect_timeout_secs = 1;

        let dialer = BackendDialer::from_config(&config);
        let err = dialer.dial(&target(&address)).await.err().unwrap();
        assert!(matches!(err, RelayError::BackendUnreachable { .. }));
        drop(listener);
    }
}
