//! One-directional byte copy between two legs of a relay session.

use std::{
    pin::Pin, sync::{
        Arc, atomic::{AtomicU64, Ordering}
    }
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt}, sync::{mpsc, watch}
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RelayError, RelayResult};

#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk in arrival order; `None` once the stream has ended.
    async fn next_chunk(&mut self) -> Option<Bytes>;
}

#[async_trait]
pub trait ByteSink: Send {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()>;

    /// Signal end-of-stream to the far side.
    async fn finish(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ByteSink for Box<dyn ByteSink> {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        (**self).send(chunk).await
    }

    async fn finish(&mut self) -> RelayResult<()> {
        (**self).finish().await
    }
}

#[async_trait]
impl ByteSource for mpsc::Receiver<Bytes> {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        self.recv().await
    }
}

#[async_trait]
impl ByteSink for mpsc::Sender<Bytes> {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        mpsc::Sender::send(self, chunk)
            .await
            .map_err(|_| RelayError::StreamTerminated("destination closed"))
    }
}

/// Adapts any async writer (a backend channel's stdin, a socket half) into a [`ByteSink`].
pub struct WriterSink {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
}

impl WriterSink {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self { writer: Box::pin(writer) }
    }
}

#[async_trait]
impl ByteSink for WriterSink {
    async fn send(&mut self, chunk: Bytes) -> RelayResult<()> {
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> RelayResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// What a pump does when its source runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEnd {
    /// End the pump, which tears the session down.
    Teardown,
    /// Forward EOF to the sink and idle until the session is cancelled.
    HalfClose,
}

#[derive(Debug)]
pub enum PumpExit {
    SourceEnded,
    SinkRefused(RelayError),
    Cancelled,
}

pub struct Pump {
    pub name: &'static str,
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
    pub on_end: SourceEnd,
    /// Hold reading until this flips to true.
    pub gate: Option<watch::Receiver<bool>>,
    /// Flipped to true once the source has ended and everything read was delivered.
    pub drained: Option<watch::Sender<bool>>,
    pub bytes: Arc<AtomicU64>,
}

impl Pump {
    pub async fn run(mut self, cancel: CancellationToken) -> PumpExit {
        if let Some(mut gate) = self.gate.take() {
            tokio::select! {
                opened = gate.wait_for(|open| *open) => {
                    if opened.is_err() {
                        debug!(pump = self.name, "gate dropped before opening");
                        return PumpExit::Cancelled;
                    }
                }
                _ = cancel.cancelled() => return PumpExit::Cancelled,
            }
        }

        loop {
            let chunk = tokio::select! {
                biased;
                chunk = self.source.next_chunk() => chunk,
                _ = cancel.cancelled() => return PumpExit::Cancelled,
            };

            let Some(chunk) = chunk else {
                trace!(pump = self.name, "source ended");
                return match self.on_end {
                    SourceEnd::Teardown => {
                        self.mark_drained();
                        PumpExit::SourceEnded
                    }
                    SourceEnd::HalfClose => {
                        if let Err(e) = self.sink.finish().await {
                            debug!(pump = self.name, error = %e, "failed to propagate EOF");
                            return PumpExit::SinkRefused(e);
                        }
                        self.mark_drained();
                        cancel.cancelled().await;
                        PumpExit::Cancelled
                    }
                };
            };

            let len = chunk.len() as u64;
            tokio::select! {
                biased;
                sent = self.sink.send(chunk) => {
                    if let Err(e) = sent {
                        return PumpExit::SinkRefused(e);
                    }
                }
                _ = cancel.cancelled() => return PumpExit::Cancelled,
            }
            self.bytes.fetch_add(len, Ordering::Relaxed);
        }
    }

    fn mark_drained(&mut self) {
        if let Some(drained) = self.drained.take() {
            drained.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pump(source: mpsc::Receiver<Bytes>, sink: mpsc::Sender<Bytes>, on_end: SourceEnd) -> (Pump, Arc<AtomicU64>) {
        let bytes = Arc::new(AtomicU64::new(0));
        (
            Pump {
                name: "test",
                source: Box::new(source),
                sink: Box::new(sink),
                on_end,
                gate: None,
                drained: None,
                bytes: bytes.clone(),
            },
            bytes,
        )
    }

    #[tokio::test]
    async fn copies_in_order_until_source_ends() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (dst_tx, mut dst_rx) = mpsc::channel(8);
        let (pump, bytes) = pump(src_rx, dst_tx, SourceEnd::Teardown);

        for chunk in ["one ", "two ", "three"] {
            src_tx.send(Bytes::from(chunk)).await.unwrap();
        }
        drop(src_tx);

        let exit = pump.run(CancellationToken::new()).await;
        assert!(matches!(exit, PumpExit::SourceEnded));
        assert_eq!(bytes.load(Ordering::Relaxed), 13);

        let mut seen = Vec::new();
        while let Some(chunk) = dst_rx.recv().await {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"one two three");
    }

    #[tokio::test]
    async fn refused_destination_ends_the_pump() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (dst_tx, dst_rx) = mpsc::channel(8);
        drop(dst_rx);
        let (pump, _) = pump(src_rx, dst_tx, SourceEnd::Teardown);
        src_tx.send(Bytes::from_static(b"x")).await.unwrap();

        let exit = pump.run(CancellationToken::new()).await;
        assert!(matches!(exit, PumpExit::SinkRefused(RelayError::StreamTerminated(_))));
    }

    #[tokio::test]
    async fn half_close_waits_for_cancellation() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (dst_tx, _dst_rx) = mpsc::channel(8);
        let (pump, _) = pump(src_rx, dst_tx, SourceEnd::HalfClose);
        drop(src_tx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), PumpExit::Cancelled));
    }

    #[tokio::test]
    async fn drained_flag_flips_after_eof_is_forwarded() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (dst_tx, mut dst_rx) = mpsc::channel(8);
        let (mut pump, _) = pump(src_rx, dst_tx, SourceEnd::HalfClose);
        let (drained_tx, mut drained_rx) = watch::channel(false);
        pump.drained = Some(drained_tx);

        src_tx.send(Bytes::from_static(b"tail")).await.unwrap();
        drop(src_tx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump.run(cancel.clone()));

        drained_rx.wait_for(|d| *d).await.unwrap();
        assert_eq!(dst_rx.recv().await.unwrap(), Bytes::from_static(b"tail"));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_an_idle_pump() {
        let (_src_tx, src_rx) = mpsc::channel::<Bytes>(8);
        let (dst_tx, _dst_rx) = mpsc::channel(8);
        let (pump, _) = pump(src_rx, dst_tx, SourceEnd::Teardown);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(pump.run(cancel).await, PumpExit::Cancelled));
    }

    #[tokio::test]
    async fn gate_holds_data_until_opened() {
        let (src_tx, src_rx) = mpsc::channel(8);
        let (dst_tx, mut dst_rx) = mpsc::channel(8);
        let (mut pump, _) = pump(src_rx, dst_tx, SourceEnd::Teardown);
        let (gate_tx, gate_rx) = watch::channel(false);
        pump.gate = Some(gate_rx);

        src_tx.send(Bytes::from_static(b"early")).await.unwrap();
        let task = tokio::spawn(pump.run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dst_rx.try_recv().is_err());

        gate_tx.send(true).unwrap();
        assert_eq!(dst_rx.recv().await.unwrap(), Bytes::from_static(b"early"));
        drop(src_tx);
        assert!(matches!(task.await.unwrap(), PumpExit::SourceEnded));
    }

    #[tokio::test]
    async fn writer_sink_writes_and_shuts_down() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut sink = WriterSink::new(client);
        sink.send(Bytes::from_static(b"hello")).await.unwrap();
        sink.finish().await.unwrap();

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }
}
