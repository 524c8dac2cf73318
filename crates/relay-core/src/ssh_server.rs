//! SSH server configuration and startup.

use std::{sync::Arc, time::Duration};

use russh::{
    MethodKind, MethodSet, server::{self as ssh_server, Server}
};
use ssh_core::keys::load_host_key;
use tracing::info;

use crate::{
    audit::{AuditSink, PrefixPolicy}, config::FortressConfig, dialer::BackendDialer, error::RelayResult, handler::ServerContext, identity::IdentityResolver, relay::SessionSettings, server_manager::ServerManager
};

/// Build the russh server configuration: secure defaults, password auth only, the configured host key.
///
/// A host key that cannot be loaded is fatal.
pub fn build_server_config(config: &FortressConfig) -> RelayResult<ssh_server::Config> {
    let host_key = load_host_key(&config.server.host_key_path, config.server.host_key_passphrase.as_deref())?;

    let mut server_config = ssh_server::Config {
        preferred: ssh_core::crypto::default_preferred(),
        auth_rejection_time: config.auth_rejection_time(),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        nodelay: true,
        ..Default::default()
    };
    server_config.methods = MethodSet::empty();
    server_config.methods.push(MethodKind::Password);
    server_config.keys.push(host_key);
    Ok(server_config)
}

/// Run the bastion until the listener fails.
pub async fn run_ssh_server(config: &FortressConfig, resolver: Arc<dyn IdentityResolver>, sink: Arc<dyn AuditSink>) -> RelayResult<()> {
    let server_config = build_server_config(config)?;

    let ctx = Arc::new(ServerContext {
        resolver,
        dialer: BackendDialer::from_config(config),
        policy: Arc::new(PrefixPolicy::from_config(&config.audit)),
        sink,
        settings: SessionSettings::from_config(config),
    });

    let mut server = ServerManager::new(ctx);
    info!(bind = %config.server.bind, port = config.server.port, "starting fortress SSH server");
    server
        .run_on_address(Arc::new(server_config), (config.server.bind.as_str(), config.server.port))
        .await?;
    Ok(())
}
