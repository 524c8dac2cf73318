//! Minimal russh `Server` that hands each TCP connection to a [`ServerHandler`].

use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    error::RelayError, handler::{ServerContext, ServerHandler, display_addr}
};

/// Factory invoked by russh whenever a client connects.
pub(crate) struct ServerManager {
    ctx: Arc<ServerContext>,
}

impl ServerManager {
    pub(crate) fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

impl russh::server::Server for ServerManager {
    type Handler = ServerHandler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = %display_addr(addr), "client connected");
        ServerHandler::new(addr, self.ctx.clone())
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        match error {
            // The dialer already logged these.
            RelayError::BackendUnreachable { .. } | RelayError::BackendAuthRejected { .. } => {
                debug!("connection closed after backend dial failure");
            }
            other => warn!(kind = other.kind(), error = %other, "client session ended with error"),
        }
    }
}
