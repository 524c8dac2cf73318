//! Per-connection russh handler: authenticates the client, dials its backend and runs one relay.

use std::{
    collections::VecDeque, net::SocketAddr, sync::{Arc, Mutex}, time::{Duration, Instant}
};

use async_trait::async_trait;
use bytes::Bytes;
use russh::{
    Channel, ChannelId, CryptoVec, Pty, Sig, server::{self as ssh_server, Auth, Handle, Msg, Session}
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audit::{AuditSink, CommandPolicy}, dialer::{BackendConnection, BackendDialer, BackendExec}, error::{RelayError, RelayResult}, identity::{AuthAttempt, Identity, IdentityResolver}, relay::{
        AuditContext, ByteSink, ChannelRequest, ClientControl, ClientEndpoints, QueuedRequest, RelaySession, SessionSettings
    }
};

/// Everything a connection needs from the running server.
pub struct ServerContext {
    pub resolver: Arc<dyn IdentityResolver>,
    pub dialer: BackendDialer,
    pub policy: Arc<dyn CommandPolicy>,
    pub sink: Arc<dyn AuditSink>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Authenticating,
    Authenticated,
    /// Backend being dialed, or dialed and waiting for the session channel.
    Dialing,
    Relaying,
    Closed,
}

impl ConnectionState {
    pub fn can_move_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Accepted, Authenticating) | (Authenticating, Authenticating) => true,
            (Authenticating, Authenticated) | (Authenticated, Dialing) | (Dialing, Relaying) => true,
            _ => false,
        }
    }
}

/// Client input chunks buffered between the session loop and the input pump.
const CLIENT_INPUT_CAPACITY: usize = 64;
/// Bytes of client input kept while no program has been started yet.
const HELD_INPUT_LIMIT: usize = 1 << 20;
/// Extra time the session loop waits for a reply beyond the forwarder's own timeout.
const REPLY_GRACE: Duration = Duration::from_secs(1);

/// Connection state, shared with the task that outlives the relay.
#[derive(Clone)]
struct ConnectionStatus {
    peer: String,
    state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionStatus {
    fn new(peer: String) -> Self {
        Self {
            peer,
            state: Arc::new(Mutex::new(ConnectionState::Accepted)),
        }
    }

    fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next && next == ConnectionState::Closed {
            return;
        }
        if !state.can_move_to(next) {
            warn!(peer = %self.peer, from = ?*state, to = ?next, "ignoring illegal connection state change");
            return;
        }
        debug!(peer = %self.peer, from = ?*state, to = ?next, "connection state");
        *state = next;
    }
}

struct ActiveRelay {
    channel: ChannelId,
    input: ClientInput,
    requests: mpsc::UnboundedSender<QueuedRequest>,
    cancel: CancellationToken,
}

/// The session loop's end of the client input channel.
struct ClientInput {
    /// `None` once the client has sent EOF.
    sender: Option<mpsc::Sender<Bytes>>,
    /// Input that did not fit the channel before a program was started.
    held: VecDeque<Bytes>,
    held_bytes: usize,
    program_started: bool,
    eof_pending: bool,
    cancel: CancellationToken,
}

impl ClientInput {
    fn new(sender: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            sender: Some(sender),
            held: VecDeque::new(),
            held_bytes: 0,
            program_started: false,
            eof_pending: false,
            cancel,
        }
    }

    /// Hand a chunk to the relay. Once a program runs this waits for room in the channel, so a
    /// slow backend holds back the client's window.
    async fn feed(&mut self, chunk: Bytes) {
        let Some(sender) = self.sender.clone() else {
            return;
        };
        if !self.program_started {
            // Nothing drains the channel until a program runs.
            let chunk = if self.held.is_empty() {
                match sender.try_send(chunk) {
                    Ok(()) => return,
                    Err(TrySendError::Closed(_)) => {
                        self.sender = None;
                        return;
                    }
                    Err(TrySendError::Full(chunk)) => chunk,
                }
            } else {
                chunk
            };
            if self.held_bytes + chunk.len() > HELD_INPUT_LIMIT {
                warn!(len = chunk.len(), held = self.held_bytes, "client input before program start over limit; dropped");
                return;
            }
            self.held_bytes += chunk.len();
            self.held.push_back(chunk);
            return;
        }
        let delivered = tokio::select! {
            sent = sender.send(chunk) => sent.is_ok(),
            _ = self.cancel.cancelled() => true,
        };
        if !delivered {
            self.sender = None;
        }
    }

    /// Release held input now that the backend is running a program.
    async fn start_program(&mut self) {
        self.program_started = true;
        self.held_bytes = 0;
        while let Some(chunk) = self.held.pop_front() {
            self.feed(chunk).await;
        }
        if self.eof_pending {
            self.sender = None;
        }
    }

    fn eof(&mut self) {
        if self.held.is_empty() {
            self.sender = None;
        } else {
            self.eof_pending = true;
        }
    }
}

/// Tracks one client connection from handshake to disconnect.
pub struct ServerHandler {
    ctx: Arc<ServerContext>,
    peer_addr: Option<SocketAddr>,
    status: ConnectionStatus,
    identity: Option<Identity>,
    backend: Option<Arc<BackendConnection>>,
    relay: Option<ActiveRelay>,
    relay_used: bool,
    connected_at: Instant,
    closed: bool,
}

impl ServerHandler {
    pub fn new(peer_addr: Option<SocketAddr>, ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            peer_addr,
            status: ConnectionStatus::new(display_addr(peer_addr)),
            identity: None,
            backend: None,
            relay: None,
            relay_used: false,
            connected_at: Instant::now(),
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    fn transition(&mut self, next: ConnectionState) {
        self.status.transition(next);
    }

    fn username(&self) -> &str {
        self.identity.as_ref().map(|i| i.username.as_str()).unwrap_or("<unauthenticated>")
    }

    fn active_relay(&mut self, channel: ChannelId) -> Option<&mut ActiveRelay> {
        self.relay.as_mut().filter(|r| r.channel == channel)
    }

    /// Forward an in-channel request and answer the client with the backend's reply.
    ///
    /// russh remembers only the latest request's reply flag per channel, so the answer has to be
    /// given before this callback returns and the next request is read.
    async fn forward_request(&mut self, channel: ChannelId, request: ChannelRequest, session: &mut Session) -> RelayResult<()> {
        let peer = display_addr(self.peer_addr);
        let wait = self.ctx.settings.reply_timeout + REPLY_GRACE;
        let kind = request.kind.clone();
        let starts_program = request.starts_program();

        let Some(relay) = self.active_relay(channel) else {
            debug!(peer = %peer, kind = %kind, "request on a channel without a relay");
            session.channel_failure(channel)?;
            return Ok(());
        };
        let (queued, reply) = QueuedRequest::new(request);
        if relay.requests.send(queued).is_err() {
            debug!(peer = %peer, kind = %kind, "request after the relay ended");
            session.channel_failure(channel)?;
            return Ok(());
        }
        let Some(reply) = reply else {
            return Ok(());
        };

        let accepted = match tokio::time::timeout(wait, reply).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(peer = %peer, kind = %kind, "relay did not answer the request");
                false
            }
        };
        if accepted {
            session.channel_success(channel)?;
            if starts_program {
                relay.input.start_program().await;
            }
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    fn refuse_channel(&self, kind: &str, detail: String) -> bool {
        let error = RelayError::UnsupportedChannelType(kind.to_string());
        warn!(
            peer = %display_addr(self.peer_addr),
            user = %self.username(),
            kind = error.kind(),
            detail = %detail,
            "{error}"
        );
        false
    }

    fn start_relay(&mut self, channel: ChannelId, handle: Handle, backend: Arc<BackendConnection>, exec: BackendExec) {
        let (input_tx, input_rx) = mpsc::channel(CLIENT_INPUT_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let leg = ClientLeg { handle, channel };

        let (username, backend_address) = match &self.identity {
            Some(identity) => (identity.username.clone(), identity.target.address.clone()),
            None => (String::new(), backend.address().to_string()),
        };

        let session = RelaySession::new(
            ClientEndpoints {
                input: Box::new(input_rx),
                requests: requests_rx,
                output: Box::new(ClientOutput(leg.clone())),
                errors: Box::new(ClientStderr(leg.clone())),
                control: Arc::new(leg),
            },
            exec.into_endpoints(),
            AuditContext {
                username,
                backend_address,
                policy: self.ctx.policy.clone(),
                sink: self.ctx.sink.clone(),
            },
            self.ctx.settings,
        );
        let relay = session.spawn();
        let cancel = relay.cancel_token();

        let status = self.status.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.wait().await {
                debug!(error = %e, "relay ended abnormally");
            }
            backend.disconnect().await;
            status.transition(ConnectionState::Closed);
        });

        self.relay = Some(ActiveRelay {
            channel,
            input: ClientInput::new(input_tx, cancel.clone()),
            requests: requests_tx,
            cancel,
        });
        self.relay_used = true;
        self.transition(ConnectionState::Relaying);
    }

    fn log_disconnect(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(relay) = self.relay.take() {
            relay.cancel.cancel();
        }
        self.transition(ConnectionState::Closed);

        info!(
            peer = %display_addr(self.peer_addr),
            user = %self.username(),
            duration = ?self.connected_at.elapsed(),
            reason,
            "client disconnected",
        );
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        if !self.closed {
            // Abrupt disconnects never reach channel_close.
            self.log_disconnect("connection dropped");
        }
    }
}

impl ssh_server::Handler for ServerHandler {
    type Error = RelayError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.transition(ConnectionState::Authenticating);
        let attempt = AuthAttempt::new(user, password, self.peer_addr);
        match self.ctx.resolver.resolve(&attempt) {
            Ok(target) => {
                debug!(peer = %display_addr(self.peer_addr), user, backend = %target.address, "principal resolved");
                self.identity = Some(Identity::new(attempt, target));
                Ok(Auth::Accept)
            }
            Err(e) => {
                info!(peer = %display_addr(self.peer_addr), user, kind = e.kind(), "password attempt refused");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        self.transition(ConnectionState::Authenticated);
        self.transition(ConnectionState::Dialing);
        let Some(identity) = &self.identity else {
            return Err(RelayError::AuthenticationFailed("<unknown>".to_string()));
        };
        info!(peer = %display_addr(self.peer_addr), user = %identity.username, backend = %identity.target.address, "client authenticated");

        let dialed = self.ctx.dialer.dial(&identity.target).await;
        match dialed {
            Ok(backend) => {
                self.backend = Some(Arc::new(backend));
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
        let id = channel.id();
        if self.relay_used || self.state() != ConnectionState::Dialing {
            info!(peer = %display_addr(self.peer_addr), user = %self.username(), channel = ?id, "rejecting additional session channel");
            return Ok(false);
        }
        let Some(backend) = self.backend.clone() else {
            return Ok(false);
        };

        let exec = match backend.open_exec().await {
            Ok(exec) => exec,
            Err(e) => {
                warn!(peer = %display_addr(self.peer_addr), user = %self.username(), kind = e.kind(), error = %e, "could not open backend channel");
                return Ok(false);
            }
        };

        self.start_relay(id, session.handle(), backend, exec);
        // The relay talks to the client through the session handle.
        drop(channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("direct-tcpip", format!("{host_to_connect}:{port_to_connect}")))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("forwarded-tcpip", format!("{host_to_connect}:{port_to_connect}")))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("x11", format!("{originator_address}:{originator_port}")))
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.refuse_channel("direct-streamlocal@openssh.com", socket_path.to_string()))
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
        warn!(peer = %display_addr(self.peer_addr), user = %self.username(), address, port = *port, "refusing tcpip-forward");
        Ok(false)
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(peer = %display_addr(self.peer_addr), address, port, "refusing cancel-tcpip-forward");
        Ok(false)
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(relay) = self.active_relay(channel) {
            relay.input.feed(Bytes::copy_from_slice(data)).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(relay) = self.active_relay(channel) {
            debug!(channel = ?channel, "client sent EOF");
            relay.input.eof();
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if self.relay.as_ref().is_some_and(|r| r.channel == channel)
            && let Some(relay) = self.relay.take()
        {
            debug!(channel = ?channel, "client closed the relayed channel");
            relay.cancel.cancel();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::pty(term, col_width, row_height, pix_width, pix_height, modes);
        self.forward_request(channel, request, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::env(variable_name, variable_value), session).await
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::shell(), session).await
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::exec(data), session).await
    }

    async fn subsystem_request(&mut self, channel: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::subsystem(name), session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::window_change(col_width, row_height, pix_width, pix_height);
        self.forward_request(channel, request, session).await
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, session: &mut Session) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelRequest::signal(&signal), session).await
    }
}

/// The inbound channel as seen from relay tasks.
#[derive(Clone)]
struct ClientLeg {
    handle: Handle,
    channel: ChannelId,
}

const CLIENT_GONE: RelayError = RelayError::StreamTerminated("client channel closed");

#[async_trait]
impl ClientControl for ClientLeg {
    async fn exit_status(&self, code: u32) -> RelayResult<()> {
        self.handle.exit_status_request(self.channel, code).await.map_err(|_| CLIENT_GONE)
    }

    async fn exit_signal(&self, signal: Sig, core_dumped: bool, message: String) -> RelayResult<()> {
        self.handle
            .exit_signal_request(self.channel, signal, core_dumped, message, String::new())
            .await
            .map_err(|_| CLIENT_GONE)
    }

    async fn close(&self) -> RelayResult<()> {
        let _ = self.handle.eof(self.channel).await;
        self.handle.close(self.channel).await.map_err(|_| CLIENT_GONE)
    }
}

struct ClientOutput(ClientLeg);

#[async_trait]
impl ByteSink for ClientOutput {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        let leg = &self.0;
        leg.handle
            .data(leg.channel, CryptoVec::from_slice(&chunk))
            .await
            .map_err(|_| CLIENT_GONE)
    }

    async fn finish(&mut self) -> RelayResult<()> {
        self.0.handle.eof(self.0.channel).await.map_err(|_| CLIENT_GONE)
    }
}

struct ClientStderr(ClientLeg);

const SSH_EXTENDED_DATA_STDERR: u32 = 1;

#[async_trait]
impl ByteSink for ClientStderr {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        let leg = &self.0;
        leg.handle
            .extended_data(leg.channel, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(&chunk))
            .await
            .map_err(|_| CLIENT_GONE)
    }
}

/// Display helper used for tracing; keeps logging concise when the socket address is unavailable.
pub(crate) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "<unknown>".into())
}
