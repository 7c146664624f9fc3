// ── BACnet/IP UDP client ──
//
// One socket shared by every controller in the process. Requests are
// tagged with an invoke id; a background receive task routes replies
// back to the waiting caller. Callers get a timeout, never a hang.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use super::codec::{self, Apdu};
use super::{ReadAccessResult, ReadAccessSpec};
use crate::error::Error;

const RECEIVE_BUFFER_SIZE: usize = 2048;

// ── ReadPropertyMultiple ────────────────────────────────────────────

/// A transport able to issue ReadPropertyMultiple requests.
///
/// Implemented by [`BacnetClient`]; controllers depend on this trait so
/// tests can substitute a scripted device.
#[async_trait]
pub trait ReadPropertyMultiple: Send + Sync {
    async fn read_property_multiple(
        &self,
        device: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> Result<Vec<ReadAccessResult>, Error>;
}

// ── Config ──────────────────────────────────────────────────────────

/// Socket and timing settings for [`BacnetClient`].
#[derive(Debug, Clone)]
pub struct BacnetClientConfig {
    /// Local address to bind. Default: `0.0.0.0:47808`.
    pub bind: SocketAddr,

    /// How long to wait for a reply to one request. Default: 1s.
    pub apdu_timeout: Duration,
}

impl Default for BacnetClientConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 47808)),
            apdu_timeout: Duration::from_millis(1000),
        }
    }
}

// ── BacnetClient ────────────────────────────────────────────────────

type PendingMap = DashMap<u8, (SocketAddr, oneshot::Sender<Apdu>)>;

/// Handle to the shared BACnet/IP socket.
///
/// Cheaply cloneable. The receive task stops when the last handle is
/// dropped or the parent cancellation token fires.
#[derive(Clone)]
pub struct BacnetClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    socket: Arc<UdpSocket>,
    pending: Arc<PendingMap>,
    next_invoke_id: AtomicU8,
    apdu_timeout: Duration,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl BacnetClient {
    /// Bind the socket and spawn the receive task.
    pub async fn bind(config: &BacnetClientConfig, cancel: &CancellationToken) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind(config.bind).await?);
        socket.set_broadcast(true)?;
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());

        let task_cancel = cancel.child_token();
        tokio::spawn(receive_task(
            Arc::clone(&socket),
            Arc::clone(&pending),
            task_cancel.clone(),
        ));

        debug!(bind = %config.bind, "BACnet client bound");

        Ok(Self {
            inner: Arc::new(ClientInner {
                socket,
                pending,
                next_invoke_id: AtomicU8::new(0),
                apdu_timeout: config.apdu_timeout,
                cancel: task_cancel.clone(),
                _guard: task_cancel.drop_guard(),
            }),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Stop the receive task. Outstanding requests fail with [`Error::Closed`].
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    fn allocate_invoke_id(&self, device: SocketAddr) -> Result<(u8, oneshot::Receiver<Apdu>), Error> {
        for _ in 0..=u8::MAX {
            let id = self.inner.next_invoke_id.fetch_add(1, Ordering::Relaxed);
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.inner.pending.entry(id) {
                let (tx, rx) = oneshot::channel();
                slot.insert((device, tx));
                return Ok((id, rx));
            }
        }
        Err(Error::decode("all invoke ids are in flight"))
    }
}

#[async_trait]
impl ReadPropertyMultiple for BacnetClient {
    async fn read_property_multiple(
        &self,
        device: SocketAddr,
        specs: &[ReadAccessSpec],
    ) -> Result<Vec<ReadAccessResult>, Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let (invoke_id, rx) = self.allocate_invoke_id(device)?;
        let frame = codec::encode_read_property_multiple(invoke_id, specs);
        trace!(%device, invoke_id, objects = specs.len(), "sending ReadPropertyMultiple");

        if let Err(e) = self.inner.socket.send_to(&frame, device).await {
            self.inner.pending.remove(&invoke_id);
            return Err(e.into());
        }

        let apdu = match tokio::time::timeout(self.inner.apdu_timeout, rx).await {
            Ok(Ok(apdu)) => apdu,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                self.inner.pending.remove(&invoke_id);
                return Err(Error::Timeout {
                    timeout_ms: u64::try_from(self.inner.apdu_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        match apdu {
            Apdu::ReadPropertyMultipleAck(results) => Ok(results),
            Apdu::Error { class, code } => Err(Error::Protocol { class, code }),
            Apdu::Reject { reason } => Err(Error::Rejected { reason }),
            Apdu::Abort { reason } => Err(Error::Aborted { reason }),
            Apdu::SimpleAck => Err(Error::decode("unexpected Simple-ACK")),
        }
    }
}

// ── Receive loop ────────────────────────────────────────────────────

async fn receive_task(socket: Arc<UdpSocket>, pending: Arc<PendingMap>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "BACnet socket receive failed");
                        continue;
                    }
                };
                let Some(datagram) = buf.get(..len) else { continue };
                match codec::decode_frame(datagram) {
                    Ok(frame) => route(&pending, from, frame),
                    Err(e) => debug!(%from, error = %e, "ignoring undecodable BACnet frame"),
                }
            }
        }
    }

    // Dropping the senders wakes every waiter with `Closed`.
    pending.clear();
    debug!("BACnet receive task stopped");
}

fn route(pending: &PendingMap, from: SocketAddr, frame: codec::Frame) {
    let matches_device = pending
        .get(&frame.invoke_id)
        .is_some_and(|entry| entry.0 == from);
    if !matches_device {
        trace!(%from, invoke_id = frame.invoke_id, "unsolicited BACnet reply");
        return;
    }
    if let Some((_, (_, tx))) = pending.remove(&frame.invoke_id) {
        let _ = tx.send(frame.apdu);
    }
}
