//! Mirrors backend output into the audit pipeline without slowing the client down.

use std::sync::{
    Arc, Mutex, atomic::{AtomicU64, Ordering}
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::policy::Classification;
use crate::{error::RelayResult, relay::pump::ByteSink};

/// Per-session flag saying whether output should currently be transcribed.
///
/// Starts enabled. Read by the tee before mirroring and by the audit task before emitting.
#[derive(Debug)]
pub struct AuditSwitch {
    enabled: Mutex<bool>,
}

impl AuditSwitch {
    pub fn new() -> Self {
        Self { enabled: Mutex::new(true) }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, enabled: bool) {
        *self.enabled.lock().unwrap_or_else(|e| e.into_inner()) = enabled;
    }

    pub fn apply(&self, classification: Classification) {
        self.set(classification.audit_enabled());
    }
}

impl Default for AuditSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards every chunk to the primary sink, then offers a copy to the audit tap.
///
/// The tap is bounded and never awaited: when it is full the copy is dropped and counted.
pub struct AuditTee<S> {
    primary: S,
    tap: mpsc::Sender<Bytes>,
    switch: Arc<AuditSwitch>,
    dropped: Arc<AtomicU64>,
}

impl<S: ByteSink> AuditTee<S> {
    pub fn new(primary: S, tap: mpsc::Sender<Bytes>, switch: Arc<AuditSwitch>, dropped: Arc<AtomicU64>) -> Self {
        Self {
            primary,
            tap,
            switch,
            dropped,
        }
    }
}

#[async_trait]
impl<S: ByteSink> ByteSink for AuditTee<S> {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        let mirror = self.switch.is_enabled().then(|| chunk.clone());
        self.primary.send(chunk).await?;

        if let Some(copy) = mirror {
            match self.tap.try_send(copy) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 1024 == 1 {
                        warn!(total_dropped = dropped, "audit tap full, transcript will have gaps");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("audit tap closed");
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> RelayResult<()> {
        self.primary.finish().await
    }
}
