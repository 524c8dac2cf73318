//! Destinations for decoded audit lines.

use std::{
    fmt, path::{Path, PathBuf}, sync::{
        Arc, Mutex, atomic::{AtomicU64, Ordering}
    }
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};

pub const AUDIT_TARGET: &str = "fortress::audit";

/// One captured line of backend output, attributed to the client principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub username: String,
    pub backend_address: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(username: impl Into<String>, backend_address: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            backend_address: backend_address.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.username, self.backend_address, self.text)
    }
}

/// Receives audit records. Implementations must not block the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes every record to the process log under the `fortress::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: AUDIT_TARGET,
            user = %record.username,
            backend = %record.backend_address,
            "{record}"
        );
    }
}

/// Appends records as JSON lines through a background writer task.
pub struct JsonLinesAuditSink {
    /// `None` once shut down.
    sender: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    dropped: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl JsonLinesAuditSink {
    /// Open (or create) `path` for appending and start the writer. Must run inside a tokio runtime.
    pub fn open(path: &Path, capacity: usize) -> RelayResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RelayError::config(format!("cannot open audit log {}: {e}", path.display())))?;

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(json_writer_task(receiver, tokio::fs::File::from_std(file), path.to_path_buf()));
        info!(path = %path.display(), "writing audit transcript");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            dropped: AtomicU64::new(0),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Records dropped because the writer fell behind or stopped.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting records and wait until everything queued is on disk. Records offered
    /// afterwards are counted as dropped.
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            warn!(error = %e, "audit writer task failed");
        }
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, record: &AuditRecord) {
        let sent = match &*self.sender.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(sender) => sender.try_send(record.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => "writer backlog full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            }),
            None => Err("writer stopped"),
        };
        if let Err(reason) = sent {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!(total_dropped = dropped, reason, "dropping audit records for transcript file");
            }
        }
    }
}

async fn json_writer_task(mut receiver: mpsc::Receiver<AuditRecord>, mut file: tokio::fs::File, path: PathBuf) {
    while let Some(record) = receiver.recv().await {
        let mut line = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialise audit record");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(path = %path.display(), error = %e, "failed to append audit record");
        }
    }
    if let Err(e) = file.flush().await {
        error!(path = %path.display(), error = %e, "failed to flush audit log");
    }
    debug!(path = %path.display(), "audit writer stopped");
}

/// Fans one record out to several sinks.
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

/// Keeps records in memory; useful for embedding the relay and for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rendered `[user@backend] line` strings, in emission order.
    pub fn lines(&self) -> Vec<String> {
        self.records().iter().map(ToString::to_string).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record.clone());
    }
}
