//! The byte-level connection seam under an [`crate::AgentSocket`].

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One message read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// An encoded (and possibly encrypted) packet.
    Packet(Vec<u8>),
    /// A liveness reply carrying the payload of an earlier ping.
    Pong(Vec<u8>),
}

/// A duplex connection carrying packet frames.
///
/// Implementations serialize their own reads and writes, so a transport can
/// be shared between a reader task and any number of writers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Reads the next message. `Ok(None)` means the peer closed cleanly.
    async fn read(&self) -> Result<Option<Inbound>, TransportError>;

    /// Writes one packet frame.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Sends a liveness probe.
    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Closes the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug)]
enum Frame {
    Packet(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// In-process transport; [`MemoryTransport::pair`] returns both ends.
///
/// Pings are answered by the peer's reader, the way a websocket library
/// answers them, unless auto-pong is switched off on that end.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    closed: CancellationToken,
    auto_pong: AtomicBool,
}

const MEMORY_TRANSPORT_CAPACITY: usize = 64;

impl MemoryTransport {
    /// Creates two connected ends. Closing either end closes both.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_TRANSPORT_CAPACITY);
        let closed = CancellationToken::new();
        let a = Self {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: closed.clone(),
            auto_pong: AtomicBool::new(true),
        };
        let b = Self {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed,
            auto_pong: AtomicBool::new(true),
        };
        (a, b)
    }

    /// Controls whether this end answers pings it reads.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn push(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            sent = self.tx.send(frame) => sent.map_err(|_| TransportError::Closed),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read(&self) -> Result<Option<Inbound>, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                frame = rx.recv() => frame,
            };
            match frame {
                None => return Ok(None),
                Some(Frame::Packet(data)) => return Ok(Some(Inbound::Packet(data))),
                Some(Frame::Pong(data)) => return Ok(Some(Inbound::Pong(data))),
                Some(Frame::Ping(data)) => {
                    if self.auto_pong.load(Ordering::Relaxed) {
                        self.push(Frame::Pong(data)).await?;
                    }
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.push(Frame::Packet(data.to_vec())).await
    }

    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.push(Frame::Ping(payload.to_vec())).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}
