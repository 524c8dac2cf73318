//! A running client-to-backend relay with output auditing.
//!
//! Five tasks make up a session:
//! - client input to backend stdin, held until a program has been started
//! - backend stderr to client extended data
//! - backend stdout to client, mirrored into the audit tap
//! - the request forwarder, which also carries exit reports back to the client
//! - the audit worker, which turns tapped bytes into [`AuditRecord`]s
//!
//! The first of the first four to finish cancels the rest. Both channels are closed only after
//! every task has been joined, so the tail of the output and the exit status reach the client.

use std::{
    sync::{
        Arc, atomic::{AtomicU64, Ordering}
    }, time::{Duration, Instant}
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch}, task::{JoinHandle, JoinSet}
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    control::{BackendControl, BackendEvent, ClientControl, QueuedRequest}, pump::{ByteSink, ByteSource, Pump, PumpExit, SourceEnd}, request::{ChannelRequest, EXEC, SUBSYSTEM, exec_command, subsystem_name}, teardown::Teardown
};
use crate::{
    audit::{AuditLine, AuditRecord, AuditSink, AuditSwitch, AuditTee, Classification, CommandPolicy, LineDecoder}, config::FortressConfig, error::{RelayError, RelayResult}
};

/// How long stragglers get to finish after the session has been cancelled.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// The client half of a relay.
pub struct ClientEndpoints {
    /// Bytes typed by the client.
    pub input: Box<dyn ByteSource>,
    /// Requests in arrival order, each answered through its own reply slot.
    pub requests: mpsc::UnboundedReceiver<QueuedRequest>,
    pub output: Box<dyn ByteSink>,
    /// Extended data, stream 1.
    pub errors: Box<dyn ByteSink>,
    pub control: Arc<dyn ClientControl>,
}

/// The backend half of a relay.
pub struct BackendEndpoints {
    pub stdin: Box<dyn ByteSink>,
    pub stdout: Box<dyn ByteSource>,
    pub stderr: Box<dyn ByteSource>,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
    pub control: Arc<dyn BackendControl>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub tap_capacity: usize,
    pub max_line_bytes: usize,
    pub reply_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &FortressConfig) -> Self {
        Self {
            tap_capacity: config.audit.tap_capacity,
            max_line_bytes: config.audit.max_line_bytes,
            reply_timeout: config.reply_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&FortressConfig::default())
    }
}

/// Who the session belongs to and where its transcript goes.
#[derive(Clone)]
pub struct AuditContext {
    pub username: String,
    pub backend_address: String,
    pub policy: Arc<dyn CommandPolicy>,
    pub sink: Arc<dyn AuditSink>,
}

/// Totals reported once a session has been torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub bytes_stderr: u64,
    pub audit_lines: u64,
    pub tap_dropped: u64,
    pub duration: Duration,
    pub ended_by: String,
}

pub struct RelaySession {
    client: ClientEndpoints,
    backend: BackendEndpoints,
    audit: AuditContext,
    settings: SessionSettings,
}

impl RelaySession {
    pub fn new(client: ClientEndpoints, backend: BackendEndpoints, audit: AuditContext, settings: SessionSettings) -> Self {
        Self {
            client,
            backend,
            audit,
            settings,
        }
    }

    /// Start all session tasks on the current runtime.
    pub fn spawn(self) -> RelayHandle {
        let Self {
            client,
            backend,
            audit,
            settings,
        } = self;

        let cancel = CancellationToken::new();
        let switch = Arc::new(AuditSwitch::new());
        let counters = Counters::default();
        let (tap_tx, tap_rx) = mpsc::channel(settings.tap_capacity.max(1));
        let (started_tx, started_rx) = watch::channel(false);
        let (stdout_drained_tx, stdout_drained_rx) = watch::channel(false);
        let (stderr_drained_tx, stderr_drained_rx) = watch::channel(false);

        let teardown = Teardown::new(client.control.clone(), backend.control.clone());
        let mut tasks = JoinSet::new();

        let input = Pump {
            name: "client->backend",
            source: client.input,
            sink: backend.stdin,
            on_end: SourceEnd::HalfClose,
            gate: Some(started_rx),
            drained: None,
            bytes: counters.to_backend.clone(),
        };
        let stderr = Pump {
            name: "backend-stderr->client",
            source: backend.stderr,
            sink: client.errors,
            on_end: SourceEnd::HalfClose,
            gate: None,
            drained: Some(stderr_drained_tx),
            bytes: counters.stderr.clone(),
        };
        let stdout = Pump {
            name: "backend-stdout->client",
            source: backend.stdout,
            sink: Box::new(AuditTee::new(client.output, tap_tx, switch.clone(), counters.tap_dropped.clone())),
            on_end: SourceEnd::HalfClose,
            gate: None,
            drained: Some(stdout_drained_tx),
            bytes: counters.to_client.clone(),
        };
        for pump in [input, stderr, stdout] {
            let name = pump.name;
            let token = cancel.clone();
            tasks.spawn(async move { TaskExit::Pump(name, pump.run(token).await) });
        }

        let forwarder = Forwarder {
            requests: client.requests,
            events: backend.events,
            client: client.control,
            backend: backend.control,
            switch: switch.clone(),
            policy: audit.policy.clone(),
            started: started_tx,
            drained: vec![stdout_drained_rx, stderr_drained_rx],
            reply_timeout: settings.reply_timeout,
            pending_exit: Vec::new(),
        };
        let token = cancel.clone();
        tasks.spawn(async move { TaskExit::Forwarder(forwarder.run(token).await) });

        let worker = AuditWorker {
            decoder: LineDecoder::new(settings.max_line_bytes),
            switch,
            sink: audit.sink.clone(),
            username: audit.username.clone(),
            backend_address: audit.backend_address.clone(),
        };
        let audit_task = tokio::spawn(worker.run(tap_rx));

        info!(user = %audit.username, backend = %audit.backend_address, "relay session started");
        let supervisor = tokio::spawn(supervise(tasks, audit_task, cancel.clone(), teardown, counters, audit));

        RelayHandle { cancel, supervisor }
    }
}

/// Control over a spawned [`RelaySession`].
pub struct RelayHandle {
    cancel: CancellationToken,
    supervisor: JoinHandle<SessionSummary>,
}

impl RelayHandle {
    /// Ask the session to end. Safe to call any number of times.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait until both channels have been closed.
    pub async fn wait(self) -> RelayResult<SessionSummary> {
        self.supervisor.await.map_err(|e| {
            warn!(error = %e, "relay supervisor failed");
            RelayError::StreamTerminated("relay supervisor failed")
        })
    }
}

#[derive(Default)]
struct Counters {
    to_backend: Arc<AtomicU64>,
    to_client: Arc<AtomicU64>,
    stderr: Arc<AtomicU64>,
    tap_dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
enum TaskExit {
    Pump(&'static str, PumpExit),
    Forwarder(ForwarderExit),
}

impl TaskExit {
    fn describe(&self) -> String {
        match self {
            TaskExit::Pump(name, PumpExit::SourceEnded) => format!("{name} ended"),
            TaskExit::Pump(name, PumpExit::SinkRefused(e)) => format!("{name} refused: {e}"),
            TaskExit::Pump(name, PumpExit::Cancelled) => format!("{name} cancelled"),
            TaskExit::Forwarder(ForwarderExit::BackendClosed) => "backend closed".to_string(),
            TaskExit::Forwarder(ForwarderExit::Cancelled) => "cancelled".to_string(),
        }
    }
}

async fn supervise(
    mut tasks: JoinSet<TaskExit>,
    mut audit_task: JoinHandle<u64>,
    cancel: CancellationToken,
    teardown: Teardown,
    counters: Counters,
    audit: AuditContext,
) -> SessionSummary {
    let started = Instant::now();

    let ended_by = tokio::select! {
        biased;
        _ = cancel.cancelled() => "shutdown requested".to_string(),
        first = tasks.join_next() => match first {
            // A task that saw the token first must not mask the shutdown.
            _ if cancel.is_cancelled() => "shutdown requested".to_string(),
            Some(Ok(exit)) => exit.describe(),
            Some(Err(e)) => format!("task failed: {e}"),
            None => "no tasks".to_string(),
        },
    };
    debug!(user = %audit.username, ended_by = %ended_by, "relay session ending");
    cancel.cancel();

    let joined = tokio::time::timeout(JOIN_GRACE, async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(exit) => trace!(exit = %exit.describe(), "relay task finished"),
                Err(e) => warn!(error = %e, "relay task failed"),
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!(user = %audit.username, "relay tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let audit_lines = match tokio::time::timeout(JOIN_GRACE, &mut audit_task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(error = %e, "audit worker failed");
            0
        }
        Err(_) => {
            warn!(user = %audit.username, "audit worker did not drain in time; aborting");
            audit_task.abort();
            0
        }
    };

    teardown.run().await;

    let summary = SessionSummary {
        bytes_to_backend: counters.to_backend.load(Ordering::Relaxed),
        bytes_to_client: counters.to_client.load(Ordering::Relaxed),
        bytes_stderr: counters.stderr.load(Ordering::Relaxed),
        audit_lines,
        tap_dropped: counters.tap_dropped.load(Ordering::Relaxed),
        duration: started.elapsed(),
        ended_by,
    };
    info!(
        user = %audit.username,
        backend = %audit.backend_address,
        bytes_in = summary.bytes_to_backend,
        bytes_out = summary.bytes_to_client,
        bytes_err = summary.bytes_stderr,
        audit_lines = summary.audit_lines,
        tap_dropped = summary.tap_dropped,
        duration_ms = summary.duration.as_millis() as u64,
        ended_by = %summary.ended_by,
        "relay session closed"
    );
    summary
}

#[derive(Debug)]
enum ForwarderExit {
    BackendClosed,
    Cancelled,
}

struct Forwarder {
    requests: mpsc::UnboundedReceiver<QueuedRequest>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    client: Arc<dyn ClientControl>,
    backend: Arc<dyn BackendControl>,
    switch: Arc<AuditSwitch>,
    policy: Arc<dyn CommandPolicy>,
    started: watch::Sender<bool>,
    drained: Vec<watch::Receiver<bool>>,
    reply_timeout: Duration,
    /// Exit reports are held until the output streams have been flushed.
    pending_exit: Vec<BackendEvent>,
}

impl Forwarder {
    async fn run(mut self, cancel: CancellationToken) -> ForwarderExit {
        let mut requests_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.refuse_queued();
                    while let Ok(event) = self.events.try_recv() {
                        self.pending_exit.push(event);
                    }
                    self.relay_exit().await;
                    return ForwarderExit::Cancelled;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        debug!(?event, "backend reported exit");
                        self.pending_exit.push(event);
                    }
                    None => {
                        self.wait_drained(&cancel).await;
                        self.relay_exit().await;
                        return ForwarderExit::BackendClosed;
                    }
                },
                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle(request, &cancel).await,
                    None => requests_open = false,
                },
            }
        }
    }

    async fn handle(&mut self, queued: QueuedRequest, cancel: &CancellationToken) {
        let QueuedRequest { request, reply } = queued;
        self.classify(&request);

        let kind = request.kind.clone();
        let starts_program = request.starts_program();

        let accepted = match self.backend.forward(request).await {
            Ok(Some(backend_reply)) => {
                tokio::select! {
                    answer = tokio::time::timeout(self.reply_timeout, backend_reply) => match answer {
                        Ok(Ok(accepted)) => accepted,
                        Ok(Err(_)) => {
                            self.report(RelayError::forwarding(&kind, "backend went away before replying"));
                            false
                        }
                        Err(_) => {
                            self.report(RelayError::forwarding(&kind, format!("no reply within {:?}", self.reply_timeout)));
                            false
                        }
                    },
                    _ = cancel.cancelled() => false,
                }
            }
            Ok(None) => true,
            Err(e) => {
                self.report(e);
                false
            }
        };

        if starts_program && accepted {
            self.started.send_replace(true);
        }
        if let Some(reply) = reply
            && reply.send(accepted).is_err()
        {
            debug!(kind = %kind, "client stopped waiting for the reply");
        }
    }

    fn classify(&self, request: &ChannelRequest) {
        let classification = match request.kind.as_str() {
            EXEC => match exec_command(&request.payload) {
                Some(command) => {
                    let classification = self.policy.classify(&command);
                    info!(command = %command, ?classification, "exec request");
                    classification
                }
                None => {
                    debug!(len = request.payload.len(), "exec payload too short to name a command");
                    Classification::Auditable
                }
            },
            SUBSYSTEM => {
                let name = subsystem_name(&request.payload).unwrap_or_default();
                let classification = self.policy.classify_subsystem(&name);
                info!(subsystem = %name, ?classification, "subsystem request");
                classification
            }
            _ => return,
        };
        self.switch.apply(classification);
    }

    fn report(&self, error: RelayError) {
        warn!(kind = error.kind(), error = %error, "channel request not forwarded");
    }

    fn refuse_queued(&mut self) {
        while let Ok(queued) = self.requests.try_recv() {
            trace!(kind = %queued.request.kind, "refusing request queued at shutdown");
            queued.answer(false);
        }
    }

    async fn wait_drained(&mut self, cancel: &CancellationToken) {
        for drained in &mut self.drained {
            tokio::select! {
                _ = drained.wait_for(|done| *done) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn relay_exit(&mut self) {
        for event in std::mem::take(&mut self.pending_exit) {
            let result = match event {
                BackendEvent::ExitStatus(code) => self.client.exit_status(code).await,
                BackendEvent::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                } => self.client.exit_signal(signal, core_dumped, message).await,
            };
            if let Err(e) = result {
                debug!(error = %e, "could not relay exit report");
            }
        }
    }
}

/// Turns tapped output into audit records.
struct AuditWorker {
    decoder: LineDecoder,
    switch: Arc<AuditSwitch>,
    sink: Arc<dyn AuditSink>,
    username: String,
    backend_address: String,
}

impl AuditWorker {
    /// Runs until the tap closes, then flushes any unterminated line. Returns the number of records.
    async fn run(mut self, mut tap: mpsc::Receiver<Bytes>) -> u64 {
        let mut emitted = 0;
        while let Some(chunk) = tap.recv().await {
            for line in self.decoder.feed(&chunk) {
                emitted += self.emit(line) as u64;
            }
        }
        if let Some(line) = self.decoder.finish() {
            emitted += self.emit(line) as u64;
        }
        emitted
    }

    fn emit(&self, line: AuditLine) -> bool {
        match line {
            AuditLine::Text(text) => {
                // Output already in flight when a transfer started must not be recorded.
                if !self.switch.is_enabled() {
                    trace!("auditing off; line discarded");
                    return false;
                }
                self.sink
                    .record(&AuditRecord::new(self.username.as_str(), self.backend_address.as_str(), text));
                true
            }
            AuditLine::Rejected(issue) => {
                let error = RelayError::AuditDecode(issue.to_string());
                warn!(user = %self.username, kind = error.kind(), error = %error, "audit line dropped");
                false
            }
        }
    }
}

impl std::fmt::Debug for AuditContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditContext")
            .field("username", &self.username)
            .field("backend_address", &self.backend_address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
