//! Blocking receive side of a module socket.
//!
//! A router holds at most one received-but-unconsumed packet. A receive
//! call that pulls a packet not matching its filter parks it in that slot;
//! the next arrival pre-empts (acknowledges and drops) whatever is parked.

use crate::error::HubError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vxproto_types::{Packet, PacketType};

/// How long a receive call waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    /// Wait until a packet arrives or the mailbox closes.
    Block,
    /// Check once without waiting.
    Poll,
    /// Wait up to the given duration.
    After(Duration),
}

impl RecvTimeout {
    /// Maps the millisecond convention: `-1` blocks, `0` polls, `N > 0`
    /// waits up to N ms.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::Poll,
            ms if ms < 0 => Self::Block,
            ms => Self::After(Duration::from_millis(ms as u64)),
        }
    }
}

/// Which packets a receive call accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvFilter {
    pub ptype: Option<PacketType>,
    pub src: Option<String>,
}

impl RecvFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(ptype: PacketType) -> Self {
        Self {
            ptype: Some(ptype),
            src: None,
        }
    }

    pub fn from_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.ptype.map_or(true, |t| t == packet.packet_type())
            && self.src.as_deref().map_or(true, |s| s == packet.src)
    }
}

#[derive(Debug)]
pub struct Router {
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    held: Mutex<Option<Packet>>,
    closed: CancellationToken,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Router {
    pub(crate) fn new(rx: mpsc::Receiver<Packet>, closed: CancellationToken) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            held: Mutex::new(None),
            closed,
        }
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Option<Packet>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            tracing::error!("router slot lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn take_held(&self, filter: &RecvFilter) -> Option<Packet> {
        let mut held = self.held();
        if held.as_ref().is_some_and(|p| filter.matches(p)) {
            held.take()
        } else {
            None
        }
    }

    fn park(&self, packet: Packet) {
        if let Some(mut previous) = self.held().replace(packet) {
            tracing::debug!(src = %previous.src, "unconsumed packet pre-empted");
            previous.set_ack();
        }
    }

    /// Receives the next packet accepted by `filter`.
    ///
    /// Returns `Ok(None)` when the timeout elapses and
    /// [`HubError::MailboxClosed`] once the module socket has been closed
    /// and its mailbox drained. The returned packet is already acknowledged.
    pub async fn recv(&self, filter: &RecvFilter, timeout: RecvTimeout) -> Result<Option<Packet>, HubError> {
        let deadline = match timeout {
            RecvTimeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut rx = self.rx.lock().await;

        loop {
            if let Some(mut packet) = self.take_held(filter) {
                packet.set_ack();
                return Ok(Some(packet));
            }

            let mut packet = if timeout == RecvTimeout::Poll {
                match rx.try_recv() {
                    Ok(packet) => packet,
                    Err(mpsc::error::TryRecvError::Empty) if !self.closed.is_cancelled() => {
                        return Ok(None)
                    }
                    Err(_) => return Err(HubError::MailboxClosed),
                }
            } else {
                tokio::select! {
                    biased;
                    packet = rx.recv() => packet.ok_or(HubError::MailboxClosed)?,
                    _ = self.closed.cancelled() => return Err(HubError::MailboxClosed),
                    _ = until(deadline) => return Ok(None),
                }
            };

            if filter.matches(&packet) {
                packet.set_ack();
                return Ok(Some(packet));
            }
            self.park(packet);
        }
    }

    pub async fn recv_packet(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv(&RecvFilter::any(), RecvTimeout::from_millis(timeout_ms))
            .await
    }

    pub async fn recv_data(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::Data, timeout_ms).await
    }

    /// Receives the next Data packet sent by `src`.
    pub async fn recv_data_from(&self, src: &str, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        let filter = RecvFilter::of_type(PacketType::Data).from_src(src);
        self.recv(&filter, RecvTimeout::from_millis(timeout_ms)).await
    }

    pub async fn recv_file(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::File, timeout_ms).await
    }

    pub async fn recv_text(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::Text, timeout_ms).await
    }

    pub async fn recv_msg(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::Msg, timeout_ms).await
    }

    pub async fn recv_action(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::Action, timeout_ms).await
    }

    pub async fn recv_control(&self, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv_typed(PacketType::Control, timeout_ms).await
    }

    async fn recv_typed(&self, ptype: PacketType, timeout_ms: i64) -> Result<Option<Packet>, HubError> {
        self.recv(&RecvFilter::of_type(ptype), RecvTimeout::from_millis(timeout_ms))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxproto_types::{Data, Payload, Text};

    fn router() -> (mpsc::Sender<Packet>, Router, CancellationToken) {
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        (tx, Router::new(rx, closed.clone()), closed)
    }

    fn data(src: &str) -> Packet {
        let mut p = Packet::new("m", "d", Payload::Data(Data { data: src.as_bytes().to_vec() }));
        p.src = src.to_string();
        p
    }

    fn text() -> Packet {
        Packet::new("m", "d", Payload::Text(Text::default()))
    }

    #[test]
    fn timeout_conventions() {
        assert_eq!(RecvTimeout::from_millis(-1), RecvTimeout::Block);
        assert_eq!(RecvTimeout::from_millis(0), RecvTimeout::Poll);
        assert_eq!(
            RecvTimeout::from_millis(250),
            RecvTimeout::After(Duration::from_millis(250))
        );
    }

    #[tokio::test]
    async fn poll_returns_immediately_when_empty() {
        let (_tx, router, _) = router();
        assert!(router.recv_data(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let (_tx, router, _) = router();
        let started = std::time::Instant::now();
        assert!(router.recv_data(50).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocking_wait_sees_late_packet() {
        let (tx, router, _) = router();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(data("a")).await.unwrap();
        });
        let pkt = router.recv_data(-1).await.unwrap().unwrap();
        assert_eq!(pkt.src, "a");
    }

    #[tokio::test]
    async fn received_packets_are_acknowledged() {
        let (tx, router, _) = router();
        let (pkt, waiter) = data("a").with_ack();
        tx.send(pkt).await.unwrap();
        router.recv_data(0).await.unwrap().unwrap();
        assert!(waiter.wait().await);
    }

    #[tokio::test]
    async fn non_matching_packet_is_held_for_a_later_call() {
        let (tx, router, _) = router();
        tx.send(text()).await.unwrap();
        assert!(router.recv_data(0).await.unwrap().is_none());
        let held = router.recv_text(0).await.unwrap().unwrap();
        assert_eq!(held.packet_type(), PacketType::Text);
    }

    #[tokio::test]
    async fn new_arrival_preempts_held_packet() {
        let (tx, router, _) = router();
        let (first, first_ack) = data("a").with_ack();
        tx.send(first).await.unwrap();
        tx.send(data("b")).await.unwrap();
        tx.send(data("c")).await.unwrap();

        let pkt = router.recv_data_from("c", 0).await.unwrap().unwrap();
        assert_eq!(pkt.src, "c");
        // "a" was parked, then pushed out by "b" without being consumed.
        assert!(first_ack.wait().await);
        let parked = router.recv_packet(0).await.unwrap().unwrap();
        assert_eq!(parked.src, "b");
    }

    #[tokio::test]
    async fn closed_mailbox_is_drained_then_reported() {
        let (tx, router, closed) = router();
        tx.send(data("a")).await.unwrap();
        closed.cancel();
        assert!(router.recv_data(-1).await.unwrap().is_some());
        assert!(matches!(router.recv_data(-1).await, Err(HubError::MailboxClosed)));
        assert!(matches!(router.recv_data(0).await, Err(HubError::MailboxClosed)));
    }
}
