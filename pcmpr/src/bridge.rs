//! Archive bridge.
//!
//! Adapts an external archive producer or consumer to the byte stream the
//! pipeline reads and writes. The two halves are connected by a bounded
//! ordered channel of byte buffers with explicit end-of-stream; a shared
//! cancel flag propagates fatal errors from either side.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Create a connected bridge with room for `capacity` in-flight buffers.
pub fn bridge(capacity: usize, cancel: Arc<AtomicBool>) -> (BridgeWriter, BridgeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        BridgeWriter {
            tx,
            cancel: cancel.clone(),
        },
        BridgeReader {
            rx,
            current: Bytes::new(),
            cancel,
        },
    )
}

fn canceled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "archive bridge canceled")
}

/// Producer half; feeds archive bytes into the pipeline (or accepts
/// expanded bytes during extraction, through its `AsyncWrite` impl).
pub struct BridgeWriter {
    tx: mpsc::Sender<Bytes>,
    cancel: Arc<AtomicBool>,
}

impl BridgeWriter {
    /// Send one buffer; waits while the channel is full.
    pub async fn send(&mut self, data: Bytes) -> Result<(), io::Error> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(canceled_error());
        }
        self.tx
            .send(data)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge receiver gone"))
    }

    /// Explicit end-of-stream.
    pub fn close(&mut self) {
        self.tx.close_channel();
    }

    /// Propagate a fatal error to the other side.
    pub fn signal_cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.tx.close_channel();
    }
}

impl AsyncWrite for BridgeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if me.cancel.load(Ordering::Acquire) {
            return Poll::Ready(Err(canceled_error()));
        }
        match Pin::new(&mut me.tx).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut me.tx)
                    .start_send(Bytes::copy_from_slice(buf))
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "bridge receiver gone")
                    })?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "bridge receiver gone",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        Pin::new(&mut me.tx)
            .poll_flush(cx)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge receiver gone"))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

/// Consumer half; read by the pipeline as a plain byte stream.
pub struct BridgeReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    cancel: Arc<AtomicBool>,
}

impl BridgeReader {
    pub fn signal_cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.rx.close();
    }
}

impl AsyncRead for BridgeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.cancel.load(Ordering::Acquire) {
            return Poll::Ready(Err(canceled_error()));
        }
        while me.current.is_empty() {
            match me.rx.poll_next_unpin(cx) {
                // Sender dropped or closed: clean end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(bytes)) => me.current = bytes,
                Poll::Pending => return Poll::Pending,
            }
        }
        let take = std::cmp::min(buf.remaining(), me.current.len());
        buf.put_slice(&me.current.split_to(take));
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn producer_bytes_arrive_in_order() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut writer, mut reader) = bridge(4, cancel);
        let producer = tokio::spawn(async move {
            for part in [&b"first "[..], b"second ", b"third"] {
                writer.send(Bytes::from_static(part)).await.unwrap();
            }
            writer.close();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(out, b"first second third");
    }

    #[tokio::test]
    async fn async_write_side_round_trips() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut writer, mut reader) = bridge(2, cancel);
        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            out
        });
        writer.write_all(b"expanded archive bytes").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(consumer.await.unwrap(), b"expanded archive bytes");
    }

    #[tokio::test]
    async fn backpressure_bounds_in_flight_buffers() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut writer, mut reader) = bridge(1, cancel);
        let producer = tokio::spawn(async move {
            for i in 0..32u8 {
                writer.send(Bytes::from(vec![i; 16])).await.unwrap();
            }
            writer.close();
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(out.len(), 32 * 16);
    }

    #[tokio::test]
    async fn cancel_surfaces_on_both_sides() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (mut writer, mut reader) = bridge(2, cancel.clone());
        writer.signal_cancel();
        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).await.is_err());
        assert!(cancel.load(Ordering::Acquire));
    }
}
