//! Deferred delivery.
//!
//! A packet whose destination cannot be resolved yet is parked here and
//! replayed on every tick until it is delivered or older than the TTL.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;
use vxproto_types::Packet;

/// A parked packet with the time it was first deferred.
#[derive(Debug)]
pub(crate) struct Deferred {
    pub packet: Packet,
    pub since: Instant,
}

/// Bounded FIFO of deferred packets. A full queue evicts its oldest entry.
#[derive(Debug)]
pub(crate) struct DeferredQueue {
    name: &'static str,
    capacity: usize,
    entries: Mutex<VecDeque<Deferred>>,
}

impl DeferredQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<Deferred>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::error!(queue = self.name, "deferred queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Parks a packet, keeping the time it was first deferred.
    pub fn push(&self, packet: Packet, since: Instant) {
        let mut entries = self.entries();
        while entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                tracing::warn!(
                    queue = self.name,
                    dst = %evicted.packet.dst,
                    "deferred queue full, evicting oldest packet"
                );
            }
        }
        entries.push_back(Deferred { packet, since });
    }

    /// Removes and returns every parked packet in arrival order.
    pub fn take_all(&self) -> Vec<Deferred> {
        self.entries().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Drops every parked packet.
    pub fn clear(&self) {
        let dropped = self.take_all().len();
        if dropped > 0 {
            tracing::debug!(queue = self.name, dropped, "deferred queue drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxproto_types::{Data, Payload};

    fn pkt(dst: &str) -> Packet {
        Packet::new("m", dst, Payload::Data(Data::default()))
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let q = DeferredQueue::new("test", 2);
        let now = Instant::now();
        q.push(pkt("a"), now);
        q.push(pkt("b"), now);
        q.push(pkt("c"), now);
        let dsts: Vec<String> = q.take_all().into_iter().map(|d| d.packet.dst).collect();
        assert_eq!(dsts, vec!["b", "c"]);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn evicted_packets_are_not_acknowledged() {
        let q = DeferredQueue::new("test", 1);
        let (first, waiter) = pkt("a").with_ack();
        q.push(first, Instant::now());
        q.push(pkt("b"), Instant::now());
        assert!(!waiter.wait().await);
    }
}
