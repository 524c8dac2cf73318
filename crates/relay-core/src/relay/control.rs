//! Out-of-band operations on each leg of a relay: exit reports, request forwarding and closing.

use async_trait::async_trait;
use russh::Sig;
use tokio::sync::oneshot;

use super::request::ChannelRequest;
use crate::error::RelayResult;

/// The client-facing channel.
#[async_trait]
pub trait ClientControl: Send + Sync {
    async fn exit_status(&self, code: u32) -> RelayResult<()>;

    async fn exit_signal(&self, signal: Sig, core_dumped: bool, message: String) -> RelayResult<()>;

    /// Send EOF and CLOSE on the channel.
    async fn close(&self) -> RelayResult<()>;
}

/// A client request waiting for the forwarder. `reply` resolves with the backend's answer;
/// dropping it unanswered means the request was refused.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: ChannelRequest,
    pub reply: Option<oneshot::Sender<bool>>,
}

impl QueuedRequest {
    /// Queue `request`, returning the receiver for its answer when it wants one.
    pub fn new(request: ChannelRequest) -> (Self, Option<oneshot::Receiver<bool>>) {
        if request.want_reply {
            let (tx, rx) = oneshot::channel();
            (Self { request, reply: Some(tx) }, Some(rx))
        } else {
            (Self { request, reply: None }, None)
        }
    }

    pub fn answer(self, accepted: bool) {
        if let Some(reply) = self.reply {
            let _ = reply.send(accepted);
        }
    }
}

/// The backend channel.
#[async_trait]
pub trait BackendControl: Send + Sync {
    /// Send `request` to the backend. When the request wants a reply, the receiver resolves with
    /// the backend's answer.
    async fn forward(&self, request: ChannelRequest) -> RelayResult<Option<oneshot::Receiver<bool>>>;

    async fn close(&self) -> RelayResult<()>;
}

/// Things the backend reports about the program it ran.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    ExitStatus(u32),
    ExitSignal { signal: Sig, core_dumped: bool, message: String },
}
