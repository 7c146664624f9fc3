// ── JSON-lines transport ──
//
// Lets `broker` and `store` run as separate processes joined by a pipe.
// Each event is one line; a nacked line is redelivered before the next
// one is read.

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::bus::Acknowledger;
use fieldlink_core::{BusError, Delivery, MessageSink, MessageSource};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Writes every published payload as one line.
pub struct LineSink<W> {
    writer: Mutex<W>,
}

impl<W> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for LineSink<W> {
    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&payload).await.map_err(|_| BusError::Closed)?;
        writer.write_all(b"\n").await.map_err(|_| BusError::Closed)?;
        writer.flush().await.map_err(|_| BusError::Closed)
    }
}

/// Reads one delivery per non-empty line until end of input.
pub struct LineSource<R> {
    lines: Lines<R>,
    requeue_tx: mpsc::UnboundedSender<Bytes>,
    requeue_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl<R: AsyncBufRead + Unpin> LineSource<R> {
    pub fn new(reader: R) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            lines: reader.lines(),
            requeue_tx,
            requeue_rx,
        }
    }

    fn delivery(&self, payload: Bytes, redelivered: bool) -> Delivery {
        let acker = LineAcker {
            payload: payload.clone(),
            tx: self.requeue_tx.clone(),
        };
        Delivery::new(payload, redelivered, Box::new(acker))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageSource for LineSource<R> {
    async fn next(&mut self) -> Option<Delivery> {
        if let Ok(payload) = self.requeue_rx.try_recv() {
            return Some(self.delivery(payload, true));
        }
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => return Some(self.delivery(Bytes::from(line), false)),
                Ok(None) => {
                    return self
                        .requeue_rx
                        .try_recv()
                        .ok()
                        .map(|payload| self.delivery(payload, true));
                }
                Err(e) => {
                    warn!(error = %e, "input stream failed");
                    return None;
                }
            }
        }
    }
}

struct LineAcker {
    payload: Bytes,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Acknowledger for LineAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError> {
        if requeue {
            self.tx.send(self.payload).map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }
}
