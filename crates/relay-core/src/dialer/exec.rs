//! Adapter turning a russh client channel into the backend half of a relay session.
//!
//! One task owns the channel. It splits incoming messages into stdout, stderr, request replies
//! and exit reports, and applies forwarded requests in arrival order. Stdin bypasses the task
//! through the channel's writer.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use russh::{Channel, ChannelMsg, client};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    error::{RelayError, RelayResult}, relay::{
        BackendControl, BackendEndpoints, BackendEvent, ChannelRequest, DecodedRequest, WriterSink, request::EXEC
    }
};

/// Chunks buffered per output stream before the backend is back-pressured.
const STREAM_CAPACITY: usize = 64;

const SSH_EXTENDED_DATA_STDERR: u32 = 1;

enum Command {
    Request(ChannelRequest, Option<oneshot::Sender<bool>>),
    Close,
}

/// The backend execution channel, split into the pieces a relay session consumes.
pub struct BackendExec {
    pub stdin: WriterSink,
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
    pub control: Arc<BackendChannelControl>,
}

impl BackendExec {
    pub(crate) fn spawn(channel: Channel<client::Msg>) -> Self {
        let stdin = WriterSink::new(channel.make_writer());
        let (stdout_tx, stdout) = mpsc::channel(STREAM_CAPACITY);
        let (stderr_tx, stderr) = mpsc::channel(STREAM_CAPACITY);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        tokio::spawn(
            Demux {
                channel,
                commands,
                stdout: Some(stdout_tx),
                stderr: Some(stderr_tx),
                events: events_tx,
                pending: VecDeque::new(),
            }
            .run(),
        );

        Self {
            stdin,
            stdout,
            stderr,
            events,
            control: Arc::new(BackendChannelControl { commands: commands_tx }),
        }
    }

    pub fn into_endpoints(self) -> BackendEndpoints {
        BackendEndpoints {
            stdin: Box::new(self.stdin),
            stdout: Box::new(self.stdout),
            stderr: Box::new(self.stderr),
            events: self.events,
            control: self.control,
        }
    }
}

/// Queues requests and close for the channel task.
pub struct BackendChannelControl {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl BackendControl for BackendChannelControl {
    async fn forward(&self, request: ChannelRequest) -> RelayResult<Option<oneshot::Receiver<bool>>> {
        let (reply_tx, reply_rx) = if request.want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.commands
            .send(Command::Request(request, reply_tx))
            .map_err(|_| RelayError::StreamTerminated("backend channel closed"))?;
        Ok(reply_rx)
    }

    async fn close(&self) -> RelayResult<()> {
        // Already gone is as good as closed.
        let _ = self.commands.send(Command::Close);
        Ok(())
    }
}

struct Demux {
    channel: Channel<client::Msg>,
    commands: mpsc::UnboundedReceiver<Command>,
    stdout: Option<mpsc::Sender<Bytes>>,
    stderr: Option<mpsc::Sender<Bytes>>,
    events: mpsc::UnboundedSender<BackendEvent>,
    /// Reply slots for requests sent with want_reply, oldest first.
    pending: VecDeque<oneshot::Sender<bool>>,
}

impl Demux {
    async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                msg = self.channel.wait() => {
                    let Some(msg) = msg else {
                        trace!("backend channel stream ended");
                        break;
                    };
                    if !self.on_message(msg).await {
                        break;
                    }
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Request(request, reply)) => self.apply(request, reply).await,
                    Some(Command::Close) | None => {
                        commands_open = false;
                        let _ = self.channel.eof().await;
                        let _ = self.channel.close().await;
                    }
                },
            }
        }
        debug!(channel = ?self.channel.id(), unanswered = self.pending.len(), "backend channel finished");
    }

    /// Returns false once the channel is closed.
    async fn on_message(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                forward_chunk(&mut self.stdout, Bytes::copy_from_slice(&data)).await;
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == SSH_EXTENDED_DATA_STDERR {
                    forward_chunk(&mut self.stderr, Bytes::copy_from_slice(&data)).await;
                } else {
                    trace!(ext, len = data.len(), "ignoring unknown extended data stream");
                }
            }
            ChannelMsg::Success => self.resolve(true),
            ChannelMsg::Failure => self.resolve(false),
            ChannelMsg::ExitStatus { exit_status } => {
                let _ = self.events.send(BackendEvent::ExitStatus(exit_status));
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                ..
            } => {
                let _ = self.events.send(BackendEvent::ExitSignal {
                    signal: signal_name,
                    core_dumped,
                    message: error_message,
                });
            }
            ChannelMsg::Eof => {
                self.stdout = None;
                self.stderr = None;
            }
            ChannelMsg::Close => return false,
            other => trace!(?other, "ignoring backend channel message"),
        }
        true
    }

    fn resolve(&mut self, accepted: bool) {
        match self.pending.pop_front() {
            Some(slot) => {
                let _ = slot.send(accepted);
            }
            None => debug!(accepted, "backend reply without a pending request"),
        }
    }

    async fn apply(&mut self, request: ChannelRequest, reply: Option<oneshot::Sender<bool>>) {
        match self.send_request(&request).await {
            Ok(()) => {
                if let Some(slot) = reply {
                    self.pending.push_back(slot);
                }
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "channel request not forwarded");
                if let Some(slot) = reply {
                    let _ = slot.send(false);
                }
            }
        }
    }

    async fn send_request(&self, request: &ChannelRequest) -> RelayResult<()> {
        let want_reply = request.want_reply;
        let channel = &self.channel;
        let decoded = match request.decode() {
            Ok(decoded) => decoded,
            // A short exec payload still reaches the backend, as the raw bytes it carried.
            Err(e) if request.kind == EXEC => {
                debug!(error = %e, "forwarding undecodable exec payload as-is");
                DecodedRequest::Exec {
                    command: request.payload.to_vec(),
                }
            }
            Err(e) => return Err(e),
        };

        match decoded {
            DecodedRequest::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                channel
                    .request_pty(want_reply, &term, col_width, row_height, pix_width, pix_height, &modes)
                    .await?
            }
            DecodedRequest::Env { name, value } => channel.set_env(want_reply, name, value).await?,
            DecodedRequest::Shell => channel.request_shell(want_reply).await?,
            DecodedRequest::Exec { command } => channel.exec(want_reply, command).await?,
            DecodedRequest::Subsystem { name } => channel.request_subsystem(want_reply, &name).await?,
            DecodedRequest::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => channel.window_change(col_width, row_height, pix_width, pix_height).await?,
            DecodedRequest::Signal(signal) => channel.signal(signal).await?,
        }
        Ok(())
    }
}

async fn forward_chunk(stream: &mut Option<mpsc::Sender<Bytes>>, chunk: Bytes) {
    let Some(sender) = stream else {
        trace!(len = chunk.len(), "dropping backend output after EOF");
        return;
    };
    if sender.send(chunk).await.is_err() {
        // The relay has stopped reading; keep draining the channel so replies still arrive.
        *stream = None;
    }
}
