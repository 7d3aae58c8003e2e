//! Connection liveness.

use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Missed intervals after which a connection is considered dead.
pub const PING_MISS_LIMIT: u32 = 3;

/// Keeps an agent connection alive and detects dead peers.
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    /// Starts probing the transport.
    async fn start(&self, transport: Arc<dyn Transport>);

    /// Handles a pong payload read from the transport.
    async fn process(&self, payload: &[u8]);

    /// Stops probing. Safe to call more than once.
    async fn stop(&self);
}

/// Sends a ping every `interval` and closes the transport when no pong has
/// been seen for [`PING_MISS_LIMIT`] intervals.
#[derive(Debug)]
pub struct IntervalPinger {
    interval: Duration,
    last_pong: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl IntervalPinger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_pong: Arc::new(Mutex::new(Instant::now())),
            cancel: CancellationToken::new(),
        }
    }
}

fn touch(last_pong: &Mutex<Instant>) {
    let mut guard = last_pong.lock().unwrap_or_else(|poisoned| {
        tracing::error!("pinger state lock poisoned, recovering");
        poisoned.into_inner()
    });
    *guard = Instant::now();
}

fn since(last_pong: &Mutex<Instant>) -> Duration {
    let guard = last_pong.lock().unwrap_or_else(|poisoned| {
        tracing::error!("pinger state lock poisoned, recovering");
        poisoned.into_inner()
    });
    guard.elapsed()
}

#[async_trait]
impl Pinger for IntervalPinger {
    async fn start(&self, transport: Arc<dyn Transport>) {
        touch(&self.last_pong);
        let interval = self.interval;
        let deadline = interval * PING_MISS_LIMIT;
        let last_pong = Arc::clone(&self.last_pong);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if since(&last_pong) > deadline {
                    tracing::warn!(?deadline, "no pong received, closing connection");
                    let _ = transport.close().await;
                    break;
                }

                let stamp = vxproto_types::now_millis().to_be_bytes();
                if let Err(e) = transport.ping(&stamp).await {
                    tracing::debug!(error = %e, "ping failed, stopping pinger");
                    break;
                }
            }
        });
    }

    async fn process(&self, payload: &[u8]) {
        tracing::trace!(len = payload.len(), "pong received");
        touch(&self.last_pong);
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }
}
